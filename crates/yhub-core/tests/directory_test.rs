#![allow(clippy::unwrap_used)]
// End-to-end directory tests against a wiremock hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use yhub_core::{CoreError, RefreshOutcome, Session, SessionConfig};

// ── Fixtures ────────────────────────────────────────────────────────

fn hub_api(with_relay: bool) -> serde_json::Value {
    let mut white_pages = vec![json!({
        "serialNumber": "VIRTHUB0-012345",
        "logicalName": "",
        "productName": "VirtualHub",
        "productId": 0,
        "networkUrl": "/api",
        "beacon": 0,
        "index": 0
    })];
    let mut relays = vec![];

    if with_relay {
        white_pages.push(json!({
            "serialNumber": "RELAYLO1-201D2",
            "logicalName": "garage",
            "productName": "Yocto-Relay",
            "productId": 13,
            "networkUrl": "/bySerial/RELAYLO1-201D2/api",
            "beacon": 0,
            "index": 1
        }));
        relays.push(json!({
            "hardwareId": "RELAYLO1-201D2.relay1",
            "logicalName": "door",
            "advertisedValue": "A",
            "index": 0
        }));
    }

    json!({
        "module": {
            "serialNumber": "VIRTHUB0-012345",
            "logicalName": "",
            "productName": "VirtualHub",
            "productId": 0,
            "firmwareRelease": "59863",
            "beacon": 0
        },
        "services": {
            "whitePages": white_pages,
            "yellowPages": { "Relay": relays }
        }
    })
}

fn relay_device_api(relay_name: &str, relay_value: &str) -> serde_json::Value {
    json!({
        "module": {
            "serialNumber": "RELAYLO1-201D2",
            "logicalName": "garage",
            "productName": "Yocto-Relay",
            "productId": 13,
            "firmwareRelease": "45000",
            "beacon": 0
        },
        "relay1": {
            "logicalName": relay_name,
            "advertisedValue": relay_value,
            "state": "B"
        }
    })
}

async fn session_with_hub(config: SessionConfig) -> (MockServer, Session) {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hub_api(true)))
        .mount(&server)
        .await;

    let session = Session::new(config);
    session.register_hub(&server.uri(), None).await.unwrap();
    (server, session)
}

// ── Enumeration ─────────────────────────────────────────────────────

#[tokio::test]
async fn enumeration_populates_devices_and_resolution() {
    let (_server, session) = session_with_hub(SessionConfig::default()).await;

    session.update_device_list(false).await.unwrap();

    assert_eq!(session.devices().len(), 2);

    let relay = session.find_device("RELAYLO1-201D2").unwrap();
    assert_eq!(relay.logical_name(), "garage");
    assert_eq!(relay.function_count(), 1);
    assert_eq!(relay.function_name(0), "door");

    let key = session.resolve_function("garage.door").unwrap();
    assert_eq!(key.class, "Relay");
    assert_eq!(key.hardware_id.as_str(), "RELAYLO1-201D2.relay1");

    // Every addressing form lands on the same key.
    assert_eq!(session.resolve_function("RELAYLO1-201D2.relay1").unwrap(), key);
    assert_eq!(session.resolve_function("door").unwrap(), key);

    let device = session.resolve_device("garage").unwrap();
    assert_eq!(device.serial(), "RELAYLO1-201D2");
}

#[tokio::test]
async fn device_list_validity_suppresses_reenumeration() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;

    session.update_device_list(false).await.unwrap();
    let after_first = server.received_requests().await.unwrap().len();

    // Within the 10 s validity window: a plain update is a no-op.
    session.update_device_list(false).await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), after_first);

    // Forced: re-enumerates.
    session.update_device_list(true).await.unwrap();
    assert!(server.received_requests().await.unwrap().len() > after_first);
}

#[tokio::test]
async fn vanished_devices_are_dropped_on_enumeration() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hub_api(true)))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(hub_api(false)))
        .mount(&server)
        .await;

    let session = Session::new(SessionConfig::default());
    session.register_hub(&server.uri(), None).await.unwrap();

    session.update_device_list(false).await.unwrap();
    assert!(session.find_device("RELAYLO1-201D2").is_some());

    session.update_device_list(true).await.unwrap();
    assert!(session.find_device("RELAYLO1-201D2").is_none());
    assert!(matches!(
        session.resolve_device("garage"),
        Err(CoreError::Unresolved { .. })
    ));
}

#[tokio::test]
async fn unregistering_a_hub_drops_its_devices() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();
    assert_eq!(session.devices().len(), 2);

    session.unregister_hub(&server.uri()).unwrap();
    assert!(session.devices().is_empty());
    assert!(session.resolve_device("garage").is_err());
}

// ── Rename / reindex ────────────────────────────────────────────────

#[tokio::test]
async fn rename_reindexes_before_refresh_returns() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();

    // The device now reports its relay renamed `door` -> `gate`.
    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_device_api("gate", "A")))
        .mount(&server)
        .await;

    let device = session.find_device("RELAYLO1-201D2").unwrap();
    let outcome = device.refresh().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Renamed);

    // Immediately after refresh() returns -- no enumeration in between --
    // the new name resolves and the old one is gone.
    let key = session.resolve_function("garage.gate").unwrap();
    assert_eq!(key.hardware_id.as_str(), "RELAYLO1-201D2.relay1");
    assert!(session.resolve_function("garage.door").is_err());
    assert!(!device.is_reindex_pending());
}

#[tokio::test]
async fn steady_state_refresh_does_not_reindex() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_device_api("door", "B")))
        .mount(&server)
        .await;

    let mut index_version = session.index().subscribe();
    index_version.mark_unchanged();

    let device = session.find_device("RELAYLO1-201D2").unwrap();
    let outcome = device.refresh().await.unwrap();

    assert_eq!(outcome, RefreshOutcome::Updated);
    assert_eq!(device.function_value(0), "B");
    assert!(!index_version.has_changed().unwrap(), "no rebuild expected");
}

// ── Attributes ──────────────────────────────────────────────────────

#[tokio::test]
async fn set_attribute_drops_the_cache() {
    let mut config = SessionConfig::default();
    config.cache_validity = Duration::from_secs(60);
    let (server, session) = session_with_hub(config).await;
    session.update_device_list(false).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_device_api("door", "A")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api/relay1/state"))
        .and(query_param("state", "A"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let device = session.find_device("RELAYLO1-201D2").unwrap();

    let device_api_calls = |requests: &[wiremock::Request]| {
        requests
            .iter()
            .filter(|r| r.url.path() == "/bySerial/RELAYLO1-201D2/api.json")
            .count()
    };

    // Two reads inside a 60 s validity window: one fetch.
    assert_eq!(device.read_attribute("relay1", "state").await.unwrap(), "B");
    device.read_attribute("relay1", "state").await.unwrap();
    assert_eq!(device_api_calls(&server.received_requests().await.unwrap()), 1);

    // A write invalidates; the next read refetches despite the window.
    device.set_attribute("relay1", "state", "A").await.unwrap();
    device.read_attribute("relay1", "state").await.unwrap();
    assert_eq!(device_api_calls(&server.received_requests().await.unwrap()), 2);
}

#[tokio::test]
async fn unknown_attribute_is_unresolved() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_device_api("door", "A")))
        .mount(&server)
        .await;

    let device = session.find_device("RELAYLO1-201D2").unwrap();
    let err = device.read_attribute("relay1", "nosuchattr").await.unwrap_err();
    assert!(matches!(err, CoreError::Unresolved { .. }), "got: {err:?}");
}

// ── Log pulling ─────────────────────────────────────────────────────

#[tokio::test]
async fn log_pull_feeds_lines_and_advances_position() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/logs.txt"))
        .and(query_param("pos", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("relay switched on\nrelay switched off\n@120"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/logs.txt"))
        .and(query_param("pos", "120"))
        .respond_with(ResponseTemplate::new(200).set_body_string("@120"))
        .mount(&server)
        .await;

    let device = session.find_device("RELAYLO1-201D2").unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    device.set_log_callback(move |line| {
        sink.lock().unwrap().push(line.to_owned());
    });

    device.trigger_log_pull().await.unwrap();
    assert_eq!(
        *lines.lock().unwrap(),
        vec!["relay switched on".to_owned(), "relay switched off".to_owned()]
    );
    assert_eq!(device.log_position(), 120);

    // Nothing new: position stays, no lines delivered.
    device.trigger_log_pull().await.unwrap();
    assert_eq!(lines.lock().unwrap().len(), 2);
    assert_eq!(device.log_position(), 120);
}

#[tokio::test]
async fn failed_refresh_is_recorded_but_not_terminal() {
    let (server, session) = session_with_hub(SessionConfig::default()).await;
    session.update_device_list(false).await.unwrap();

    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bySerial/RELAYLO1-201D2/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_device_api("door", "A")))
        .mount(&server)
        .await;

    let device = session.find_device("RELAYLO1-201D2").unwrap();

    let err = device.refresh().await.unwrap_err();
    assert!(err.api_error().is_some());
    assert!(device.last_error().is_some(), "failure must stay inspectable");
    // Identity from enumeration survives the failed refresh.
    assert_eq!(device.logical_name(), "garage");

    // The next attempt simply succeeds; no dead state.
    device.refresh().await.unwrap();
    assert_eq!(device.function_value(0), "A");
}
