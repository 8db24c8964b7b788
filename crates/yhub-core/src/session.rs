// ── Session ──
//
// Process-visible registry of hubs and devices. Everything hangs off the
// session object passed by reference to its consumers -- there are no
// process-wide singletons or global caches. One session owns: the hub
// table, the (hub, serial) -> device table, the name-resolution index,
// and the shared JZON reference store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use yhub_api::callback::CallbackCache;
use yhub_api::hub::{ApiCacheSlot, HubConnection, HubMode};
use yhub_api::jzon::ReferenceStore;
use yhub_api::notification::{HubEvent, ReconnectConfig};
use yhub_api::{Error, TransportConfig};

use crate::config::{HubCredentials, SessionConfig};
use crate::device::DeviceEntry;
use crate::directory::{IndexedDevice, ResolutionIndex};
use crate::error::CoreError;
use crate::model::{DeviceIdentity, FunctionKey, FunctionRecord};

/// One registered hub: its connection plus the persistent cache slot for
/// the hub-root `api.json` used by enumeration.
struct RegisteredHub {
    conn: Arc<HubConnection>,
    root_slot: ApiCacheSlot,
}

struct SessionInner {
    config: SessionConfig,
    transport: TransportConfig,
    jzon_refs: Arc<ReferenceStore>,
    hubs: DashMap<String, Arc<RegisteredHub>>,
    /// Key: `<hub root url>|<serial>`. Exactly one entry per pair for
    /// the session's lifetime.
    devices: DashMap<String, Arc<DeviceEntry>>,
    index: Arc<ResolutionIndex>,
    enumerated_at: StdMutex<Option<Instant>>,
    cancel: CancellationToken,
}

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc`. Owns hub registration, device
/// enumeration, name resolution, and notification routing.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let transport = TransportConfig {
            timeout: config.network_timeout,
            tls: config.tls,
            ..TransportConfig::default()
        };
        let jzon_refs = Arc::new(match &config.reference_dir {
            Some(dir) => ReferenceStore::with_dir(dir),
            None => ReferenceStore::in_memory(),
        });

        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                jzon_refs,
                hubs: DashMap::new(),
                devices: DashMap::new(),
                index: Arc::new(ResolutionIndex::new()),
                enumerated_at: StdMutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The name-resolution index (read side).
    pub fn index(&self) -> &Arc<ResolutionIndex> {
        &self.inner.index
    }

    /// Stop background tasks spawned by this session.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    // ── Hub lifecycle ────────────────────────────────────────────────

    /// Register a hub by root URL. Idempotent: re-registering the same
    /// URL returns the existing connection.
    ///
    /// Streaming/pure-HTTP hubs are probed once for their transport
    /// flavor; callback hubs get an inbound-POST cache wired to the
    /// configured callback password.
    pub async fn register_hub(
        &self,
        url: &str,
        credentials: Option<HubCredentials>,
    ) -> Result<Arc<HubConnection>, CoreError> {
        let conn = self.build_connection(url, credentials)?;
        let key = conn.root_url().to_string();

        if let Some(existing) = self.inner.hubs.get(&key) {
            return Ok(Arc::clone(&existing.conn));
        }

        if conn.mode() == HubMode::CallbackCache {
            conn.attach_callback_cache(Arc::new(CallbackCache::new(
                self.inner.config.callback_password.clone(),
                Arc::clone(&self.inner.jzon_refs),
            )));
        } else {
            conn.probe(Some(self.inner.config.network_timeout))
                .await?;
        }

        let conn = Arc::new(conn);
        info!(url = %key, mode = ?conn.mode(), "registered hub");
        self.inner.hubs.insert(
            key,
            Arc::new(RegisteredHub {
                conn: Arc::clone(&conn),
                root_slot: ApiCacheSlot::hub_root(),
            }),
        );

        // The device list must pick the new hub up on its next check.
        *self.inner.enumerated_at.lock().expect("enumeration lock poisoned") = None;
        Ok(conn)
    }

    /// Remove a hub and every device reached through it.
    pub fn unregister_hub(&self, url: &str) -> Result<(), CoreError> {
        let key = normalize_hub_key(url)?;
        let Some((_, hub)) = self.inner.hubs.remove(&key) else {
            return Err(CoreError::UnknownHub { url: key });
        };

        let prefix = format!("{}|", hub.conn.root_url());
        self.inner.devices.retain(|k, _| !k.starts_with(&prefix));
        reindex(&self.inner);

        info!(url = %key, "unregistered hub");
        Ok(())
    }

    /// Check a hub is reachable without registering it.
    pub async fn test_hub(
        &self,
        url: &str,
        credentials: Option<HubCredentials>,
    ) -> Result<(), CoreError> {
        let conn = self.build_connection(url, credentials)?;
        conn.probe(Some(self.inner.config.network_timeout)).await?;
        Ok(())
    }

    pub fn get_hub(&self, url: &str) -> Option<Arc<HubConnection>> {
        let key = normalize_hub_key(url).ok()?;
        self.inner.hubs.get(&key).map(|hub| Arc::clone(&hub.conn))
    }

    fn build_connection(
        &self,
        url: &str,
        credentials: Option<HubCredentials>,
    ) -> Result<HubConnection, CoreError> {
        let conn = HubConnection::new(
            url,
            credentials.map(|c| (c.user, c.password)),
            &self.inner.transport,
            Arc::clone(&self.inner.jzon_refs),
        )?;
        conn.set_cache_validity(self.inner.config.cache_validity);
        Ok(conn)
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// The unique device entry for a (hub, serial) pair, created on
    /// first use.
    pub fn get_or_create_device(
        &self,
        hub: &Arc<HubConnection>,
        serial: &str,
    ) -> Arc<DeviceEntry> {
        let key = format!("{}|{serial}", hub.root_url());
        let entry = self
            .inner
            .devices
            .entry(key)
            .or_insert_with(|| {
                debug!(%serial, hub = %hub.root_url(), "creating device entry");
                let entry = Arc::new(DeviceEntry::new(Arc::clone(hub), serial));
                let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
                entry.set_reindex_hook(move || {
                    if let Some(inner) = weak.upgrade() {
                        reindex(&inner);
                    }
                });
                entry
            });
        Arc::clone(entry.value())
    }

    /// Find a device entry by serial, across all hubs.
    pub fn find_device(&self, serial: &str) -> Option<Arc<DeviceEntry>> {
        self.inner
            .devices
            .iter()
            .find(|entry| entry.value().serial() == serial)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All device entries currently known.
    pub fn devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.inner
            .devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    // ── Enumeration ──────────────────────────────────────────────────

    /// Refresh the device directory from every registered hub.
    ///
    /// Honors the device-list validity window unless `force` is set.
    /// Every hub is attempted even when one fails; the first failure is
    /// returned after the pass and the validity window only advances on
    /// a fully clean pass. Devices a hub no longer reports are dropped.
    pub async fn update_device_list(&self, force: bool) -> Result<(), CoreError> {
        {
            let enumerated_at = self
                .inner
                .enumerated_at
                .lock()
                .expect("enumeration lock poisoned");
            if !force
                && enumerated_at
                    .is_some_and(|at| at.elapsed() < self.inner.config.device_list_validity)
            {
                return Ok(());
            }
        }

        let hubs: Vec<Arc<RegisteredHub>> = self
            .inner
            .hubs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut first_failure = None;
        for hub in hubs {
            if let Err(e) = self.enumerate_hub(&hub).await {
                warn!(hub = %hub.conn.root_url(), error = %e, "hub enumeration failed");
                first_failure.get_or_insert(e);
            }
        }

        reindex(&self.inner);

        match first_failure {
            None => {
                *self
                    .inner
                    .enumerated_at
                    .lock()
                    .expect("enumeration lock poisoned") = Some(Instant::now());
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Enumerate one hub: white pages become device records, yellow pages
    /// their function tables; devices absent from the listing are dropped.
    async fn enumerate_hub(&self, hub: &RegisteredHub) -> Result<(), CoreError> {
        let snapshot = hub.conn.request_api(&hub.root_slot, None).await?;
        let services = snapshot
            .parsed
            .get("services")
            .ok_or_else(|| Error::Protocol {
                message: "hub api.json has no services section".to_owned(),
            })?;

        let mut functions = functions_by_serial(services.get("yellowPages"));

        let white_pages = services
            .get("whitePages")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Protocol {
                message: "hub api.json has no white pages".to_owned(),
            })?;

        let mut seen = Vec::with_capacity(white_pages.len());
        for entry in white_pages {
            let Some(identity) = DeviceIdentity::from_white_pages(entry) else {
                warn!("skipping malformed white-pages entry");
                continue;
            };
            let serial = identity.serial.clone();
            let device = self.get_or_create_device(&hub.conn, &serial);
            device.apply_enumeration(identity, functions.remove(&serial).unwrap_or_default());
            seen.push(serial);
        }

        // Devices the hub no longer reports are a directory-level drop.
        let prefix = format!("{}|", hub.conn.root_url());
        self.inner.devices.retain(|key, device| {
            !key.starts_with(&prefix) || seen.iter().any(|s| s == device.serial())
        });

        debug!(hub = %hub.conn.root_url(), devices = seen.len(), "enumerated hub");
        Ok(())
    }

    // ── Name resolution ──────────────────────────────────────────────

    /// Resolve a device reference (serial or logical name).
    pub fn resolve_device(&self, name: &str) -> Result<Arc<DeviceEntry>, CoreError> {
        let serial = self
            .inner
            .index
            .resolve_device(name)
            .ok_or_else(|| CoreError::Unresolved {
                name: name.to_owned(),
            })?;
        self.find_device(&serial).ok_or(CoreError::Unresolved {
            name: serial,
        })
    }

    /// Resolve a function reference to its stable `(class, hardware id)`
    /// key -- the identity the per-class function layer caches on.
    pub fn resolve_function(&self, name: &str) -> Result<FunctionKey, CoreError> {
        self.inner
            .index
            .resolve_function(name)
            .ok_or_else(|| CoreError::Unresolved {
                name: name.to_owned(),
            })
    }

    // ── Notifications ────────────────────────────────────────────────

    /// Open the notification stream of a registered hub and route its
    /// events into the directory until the session is closed.
    pub fn watch_hub(&self, url: &str) -> Result<(), CoreError> {
        let hub = self.get_hub(url).ok_or_else(|| CoreError::UnknownHub {
            url: url.to_owned(),
        })?;

        let stream = hub.open_notification_stream(
            ReconnectConfig::default(),
            self.inner.cancel.child_token(),
        );
        let mut rx = stream.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            // Keep the stream handle alive for as long as we pump it.
            let _stream = stream;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        apply_event(&inner, &event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "notification consumer lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }
}

// ── Inner helpers (shared with hooks/tasks holding only a Weak) ──────

/// Rebuild the resolution index from the current device table.
fn reindex(inner: &SessionInner) {
    let indexed: Vec<IndexedDevice> = inner
        .devices
        .iter()
        .map(|entry| {
            let device = entry.value();
            IndexedDevice {
                serial: device.serial().to_owned(),
                logical_name: device.logical_name(),
                functions: device.functions(),
            }
        })
        .collect();
    inner.index.rebuild(indexed);

    for entry in inner.devices.iter() {
        entry.value().clear_reindex_pending();
    }
}

/// Fold one notification event into the directory.
fn apply_event(inner: &SessionInner, event: &HubEvent) {
    match event {
        HubEvent::FunctionValue {
            serial,
            function_id,
            value,
        } => {
            if let Some(device) = inner
                .devices
                .iter()
                .find(|entry| entry.value().serial() == *serial)
            {
                device.value().update_function_value(function_id, value);
            }
        }
        HubEvent::DeviceArrival { serial } | HubEvent::DeviceRemoval { serial } => {
            debug!(%serial, "device list invalidated by notification");
            *inner
                .enumerated_at
                .lock()
                .expect("enumeration lock poisoned") = None;
        }
        HubEvent::Log { .. } => {}
    }
}

/// Group yellow-pages entries by owning serial, ordered by function index.
fn functions_by_serial(yellow_pages: Option<&Value>) -> HashMap<String, Vec<FunctionRecord>> {
    let mut by_serial: HashMap<String, Vec<(u32, FunctionRecord)>> = HashMap::new();

    if let Some(classes) = yellow_pages.and_then(Value::as_object) {
        for (class, entries) in classes {
            let Some(entries) = entries.as_array() else {
                continue;
            };
            for entry in entries {
                if let Some((serial, index, record)) =
                    FunctionRecord::from_yellow_pages(class, entry)
                {
                    by_serial.entry(serial).or_default().push((index, record));
                }
            }
        }
    }

    by_serial
        .into_iter()
        .map(|(serial, mut functions)| {
            functions.sort_by_key(|(index, _)| *index);
            (
                serial,
                functions.into_iter().map(|(_, record)| record).collect(),
            )
        })
        .collect()
}

/// Normalize a hub URL to its registry key (credentials stripped,
/// trailing slash).
fn normalize_hub_key(url: &str) -> Result<String, CoreError> {
    let mut url = Url::parse(url)?;
    let _ = url.set_username("");
    let _ = url.set_password(None);
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    Ok(url.to_string())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hub_key_normalization_matches_connection_urls() {
        assert_eq!(
            normalize_hub_key("http://10.0.0.5:4444").unwrap(),
            "http://10.0.0.5:4444/"
        );
        assert_eq!(
            normalize_hub_key("http://admin:pw@10.0.0.5:4444").unwrap(),
            "http://10.0.0.5:4444/"
        );
    }

    #[test]
    fn functions_group_and_sort_by_index() {
        let yp = serde_json::json!({
            "Relay": [
                {"hardwareId": "RELAYLO1-201D2.relay2", "logicalName": "", "advertisedValue": "B", "index": 1},
                {"hardwareId": "RELAYLO1-201D2.relay1", "logicalName": "door", "advertisedValue": "A", "index": 0}
            ],
            "Temperature": [
                {"hardwareId": "TMPSENS1-33A01.temperature", "logicalName": "", "advertisedValue": "21.5", "index": 0, "baseType": "Sensor"}
            ]
        });

        let grouped = functions_by_serial(Some(&yp));
        assert_eq!(grouped.len(), 2);

        let relays = &grouped["RELAYLO1-201D2"];
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].function_id, "relay1");
        assert_eq!(relays[1].function_id, "relay2");

        let sensors = &grouped["TMPSENS1-33A01"];
        assert_eq!(sensors[0].base_type, crate::model::BaseType::Sensor);
    }

    #[tokio::test]
    async fn unknown_hub_is_an_error() {
        let session = Session::new(SessionConfig::default());
        assert!(matches!(
            session.unregister_hub("http://10.9.9.9:4444"),
            Err(CoreError::UnknownHub { .. })
        ));
        assert!(session.get_hub("http://10.9.9.9:4444").is_none());
    }
}
