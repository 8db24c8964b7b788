#![allow(clippy::unwrap_used)]
// Integration tests for `HubConnection` using wiremock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use yhub_api::hub::ApiCacheSlot;
use yhub_api::jzon::ReferenceStore;
use yhub_api::{Error, HubConnection};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, HubConnection) {
    let server = MockServer::start().await;
    let hub = HubConnection::with_client(
        reqwest::Client::new(),
        &server.uri(),
        None,
        Duration::from_secs(5),
        Arc::new(ReferenceStore::in_memory()),
    )
    .unwrap();
    (server, hub)
}

async fn setup_with_credentials(user: &str, password: &str) -> (MockServer, HubConnection) {
    let server = MockServer::start().await;
    let hub = HubConnection::with_client(
        reqwest::Client::new(),
        &server.uri(),
        Some((user.to_owned(), password.to_owned().into())),
        Duration::from_secs(5),
        Arc::new(ReferenceStore::in_memory()),
    )
    .unwrap();
    (server, hub)
}

fn relay_api() -> serde_json::Value {
    json!({
        "module": {
            "serialNumber": "RELAYLO1-201D2",
            "logicalName": "door",
            "productName": "Yocto-Relay",
            "firmwareRelease": "45000",
            "beacon": 0
        }
    })
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

// ── Cache TTL ───────────────────────────────────────────────────────

#[tokio::test]
async fn cache_hit_performs_no_transport_call() {
    let (server, hub) = setup().await;
    hub.set_cache_validity(Duration::from_millis(500));

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    let first = hub.request_api(&slot, None).await.unwrap();
    let second = hub.request_api(&slot, None).await.unwrap();

    assert_eq!(request_count(&server).await, 1, "second call must be served from cache");
    assert_eq!(first.parsed["module"]["logicalName"], "door");
    assert_eq!(*first.raw, *second.raw);
}

#[tokio::test]
async fn cache_expires_after_validity_window() {
    let (server, hub) = setup().await;
    hub.set_cache_validity(Duration::from_millis(100));

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    hub.request_api(&slot, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    hub.request_api(&slot, None).await.unwrap();

    // First call fetched canonically; the expired second call refetches
    // (differentially, now that a firmware is known).
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn drop_cache_forces_refetch() {
    let (server, hub) = setup().await;
    hub.set_cache_validity(Duration::from_secs(60));

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    hub.request_api(&slot, None).await.unwrap();
    slot.invalidate();
    hub.request_api(&slot, None).await.unwrap();

    assert_eq!(request_count(&server).await, 2);
}

// ── Digest authentication ───────────────────────────────────────────

fn challenge_response() -> ResponseTemplate {
    ResponseTemplate::new(401).insert_header(
        "WWW-Authenticate",
        "Digest realm=\"YoctoHub\", qop=\"auth\", nonce=\"dcd98b7102dd\", opaque=\"5ccc069c\"",
    )
}

#[tokio::test]
async fn challenge_then_success_uses_exactly_two_calls() {
    let (server, hub) = setup_with_credentials("admin", "hunter2").await;

    // First request is anonymous and gets the challenge...
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(challenge_response())
        .up_to_n_times(1)
        .mount(&server)
        .await;

    // ...the one retry carries a Digest Authorization header.
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    let snapshot = hub.request_api(&slot, None).await.unwrap();

    assert_eq!(request_count(&server).await, 2);
    assert_eq!(snapshot.parsed["module"]["serialNumber"], "RELAYLO1-201D2");
}

#[tokio::test]
async fn repeated_challenge_fails_after_exactly_two_calls() {
    let (server, hub) = setup_with_credentials("admin", "wrong-password").await;

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(challenge_response())
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    let err = hub.request_api(&slot, None).await.unwrap_err();

    assert!(err.is_auth(), "expected auth error, got: {err:?}");
    assert_eq!(request_count(&server).await, 2, "exactly one retry, no loop");
}

#[tokio::test]
async fn challenge_without_credentials_fails_after_one_call() {
    let (server, hub) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(challenge_response())
        .mount(&server)
        .await;

    let err = hub.request_api(&ApiCacheSlot::hub_root(), None).await.unwrap_err();

    assert!(err.is_auth());
    // No credentials: a retry could never succeed, so none is sent.
    assert_eq!(request_count(&server).await, 1);
}

// ── JZON negotiation ────────────────────────────────────────────────

#[tokio::test]
async fn second_fetch_negotiates_jzon() {
    let (server, hub) = setup().await;

    // Differential answer for `?fw=45000`: positional, no `module` key.
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .and(query_param("fw", "45000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            ["RELAYLO1-201D2", "door", "Yocto-Relay", "45000", 0]
        ])))
        .mount(&server)
        .await;

    // Canonical answer for the first fetch.
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    let canonical = hub.request_api(&slot, None).await.unwrap();

    slot.invalidate();
    let differential = hub.request_api(&slot, None).await.unwrap();

    assert_eq!(request_count(&server).await, 2);
    // Expansion reproduces the canonical structure exactly.
    assert_eq!(*differential.parsed, *canonical.parsed);
}

#[tokio::test]
async fn stale_reference_downgrades_to_one_canonical_refetch() {
    let (server, hub) = setup().await;

    // The differential answer decodes to firmware 46000 while the
    // reference was derived from 45000: stale.
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .and(query_param("fw", "45000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            ["RELAYLO1-201D2", "door", "Yocto-Relay", "46000", 0]
        ])))
        .mount(&server)
        .await;

    // First canonical fetch: firmware 45000.
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    // Fallback canonical fetch: the hub really did upgrade.
    let upgraded = json!({
        "module": {
            "serialNumber": "RELAYLO1-201D2",
            "logicalName": "door",
            "productName": "Yocto-Relay",
            "firmwareRelease": "46000",
            "beacon": 0
        }
    });
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&upgraded))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    let first = hub.request_api(&slot, None).await.unwrap();
    assert_eq!(first.parsed["module"]["firmwareRelease"], "45000");

    slot.invalidate();
    let second = hub.request_api(&slot, None).await.unwrap();

    // canonical + failed differential + canonical fallback = 3 calls,
    // and the mismatch never surfaced to the caller.
    assert_eq!(request_count(&server).await, 3);
    assert_eq!(*second.parsed, upgraded);
}

// ── Single-flight & timeouts ────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_are_serialized_per_hub() {
    let (server, hub) = setup().await;
    let hub = Arc::new(hub);

    let delay = Duration::from_millis(250);
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(relay_api())
                .set_delay(delay),
        )
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        hub.request_bytes("api.json", &[], None),
        hub.request_bytes("bySerial/RELAYLO1-201D2/api.json", &[], None),
    );
    let elapsed = started.elapsed();

    a.unwrap();
    b.unwrap();
    assert_eq!(request_count(&server).await, 2);
    assert!(
        elapsed >= delay * 2,
        "requests to one hub must not overlap (elapsed {elapsed:?})"
    );
}

#[tokio::test]
async fn timeout_surfaces_and_releases_the_slot() {
    let (server, hub) = setup().await;

    Mock::given(method("GET"))
        .and(path("/slow.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{}")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fast.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let err = hub
        .request_bytes("slow.json", &[], Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got: {err:?}");

    // The stuck request must not block the next caller.
    let started = std::time::Instant::now();
    hub.request_bytes("fast.json", &[], None).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "single-flight slot was not released after the timeout"
    );
}

// ── Probing & errors ────────────────────────────────────────────────

#[tokio::test]
async fn probe_detects_pure_http_hubs() {
    let (server, hub) = setup().await;

    Mock::given(method("GET"))
        .and(path("/info.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "serialNumber": "VIRTHUB0-abcdef",
            "protocol": "HTTP/1.1"
        })))
        .mount(&server)
        .await;

    assert_eq!(hub.mode(), yhub_api::HubMode::Streaming);
    hub.probe(None).await.unwrap();
    assert_eq!(hub.mode(), yhub_api::HubMode::PureHttp);
}

#[tokio::test]
async fn probe_tolerates_missing_info_json() {
    let (server, hub) = setup().await;

    Mock::given(method("GET"))
        .and(path("/info.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    hub.probe(None).await.unwrap();
    assert_eq!(hub.mode(), yhub_api::HubMode::Streaming);
}

#[tokio::test]
async fn missing_device_maps_to_not_found() {
    let (server, hub) = setup().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = hub
        .request_api(&ApiCacheSlot::for_device("RELAYLO1-GONE"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { .. }), "got: {err:?}");
}

#[tokio::test]
async fn failed_fetch_leaves_cache_untouched() {
    let (server, hub) = setup().await;
    hub.set_cache_validity(Duration::from_millis(50));

    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(relay_api()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let slot = ApiCacheSlot::hub_root();
    hub.request_api(&slot, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = hub.request_api(&slot, None).await.unwrap_err();
    assert!(err.is_protocol(), "got: {err:?}");

    // The slot still holds the last good snapshot, stale but intact --
    // the error path never wrote a partial one.
    let stale = slot.snapshot().unwrap();
    assert_eq!(*stale.parsed, relay_api());
}
