// ── Device record ──
//
// One entry per (hub, serial) pair, for the lifetime of the session.
// Owns the device's identity, its ordered function table, and the API
// cache slot driven by the owning hub connection. Identity changes
// trigger an immediate directory reindex through the installed hook --
// stale name resolution could hand a caller a function on the wrong
// physical device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use yhub_api::hub::{ApiCacheSlot, HubConnection};
use yhub_api::notification::split_position_marker;

use crate::error::CoreError;
use crate::model::{BaseType, DeviceIdentity, FunctionKey, FunctionRecord};

type LogCallback = Box<dyn Fn(&str) + Send + Sync>;
type ReindexHook = Box<dyn Fn() + Send + Sync>;

/// What a successful [`DeviceEntry::refresh`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// First successful snapshot: identity and function table populated.
    FirstSnapshot,
    /// Refreshed; nothing that affects name resolution changed.
    Updated,
    /// A device- or function-level logical name changed.
    Renamed,
}

#[derive(Default)]
struct DeviceData {
    identity: Option<DeviceIdentity>,
    functions: Vec<FunctionRecord>,
    /// When this record last folded in a snapshot or enumeration.
    last_seen: Option<DateTime<Utc>>,
}

/// One physical/virtual module reachable through a hub.
pub struct DeviceEntry {
    hub: Arc<HubConnection>,
    serial: String,
    slot: ApiCacheSlot,
    state: RwLock<DeviceData>,
    /// Last refresh/pull failure, kept for inspection after callers
    /// downgrade the error to a sentinel value.
    last_error: StdMutex<Option<Arc<yhub_api::Error>>>,
    /// Set when an identity change has been observed but the directory
    /// has not rebuilt its tables yet.
    reindex_pending: AtomicBool,
    reindex_hook: OnceLock<ReindexHook>,
    log_pulling: AtomicBool,
    log_position: StdMutex<u64>,
    log_callback: StdMutex<Option<LogCallback>>,
}

impl DeviceEntry {
    pub(crate) fn new(hub: Arc<HubConnection>, serial: &str) -> Self {
        Self {
            hub,
            serial: serial.to_owned(),
            slot: ApiCacheSlot::for_device(serial),
            state: RwLock::new(DeviceData::default()),
            last_error: StdMutex::new(None),
            reindex_pending: AtomicBool::new(false),
            reindex_hook: OnceLock::new(),
            log_pulling: AtomicBool::new(false),
            log_position: StdMutex::new(0),
            log_callback: StdMutex::new(None),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn hub(&self) -> &Arc<HubConnection> {
        &self.hub
    }

    /// Install the directory's rebuild hook. Called at most once, by the
    /// session that owns this entry.
    pub fn set_reindex_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.reindex_hook.set(Box::new(hook));
    }

    pub fn is_reindex_pending(&self) -> bool {
        self.reindex_pending.load(Ordering::SeqCst)
    }

    /// Last refresh/pull failure, if any. Lets callers that map errors to
    /// sentinel values recover the underlying cause.
    pub fn last_error(&self) -> Option<Arc<yhub_api::Error>> {
        self.last_error.lock().expect("error lock poisoned").clone()
    }

    // ── Refresh ──────────────────────────────────────────────────────

    /// Fetch (or reuse, within the cache TTL) the device API and fold it
    /// into this record.
    ///
    /// The first success populates identity and function table; later
    /// ones diff logical names, beacon and advertised values. Any
    /// logical-name change rebuilds the directory tables *before* this
    /// returns. A failed refresh records the error and leaves the record
    /// a candidate for the next attempt -- there is no dead state.
    pub async fn refresh(&self) -> Result<RefreshOutcome, CoreError> {
        let snapshot = match self.hub.request_api(&self.slot, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.record_error(e)),
        };

        let outcome = self.apply_api(&snapshot.parsed);
        if outcome != RefreshOutcome::Updated {
            self.reindex_now();
        }
        Ok(outcome)
    }

    /// Forget the cached API snapshot so the next read refetches.
    ///
    /// Used after state-changing requests; in steady state most callers
    /// tolerate eventual consistency up to the cache validity.
    pub fn drop_cache(&self) {
        self.slot.invalidate();
    }

    /// Fold a parsed device API structure into the record.
    fn apply_api(&self, api: &Value) -> RefreshOutcome {
        let mut state = self.state.write().expect("device lock poisoned");
        let first = state.identity.is_none();
        let mut renamed = false;

        if let Some(identity) = api.get("module").and_then(DeviceIdentity::from_module) {
            renamed |= Self::merge_identity(&mut state, identity, &self.serial);
        }

        // Function table from the yellow pages, when the response has one
        // (hub-root fetches do; per-device fetches usually don't).
        if let Some(classes) = api
            .pointer("/services/yellowPages")
            .and_then(Value::as_object)
        {
            let mut mine: Vec<(u32, FunctionRecord)> = classes
                .iter()
                .flat_map(|(class, entries)| {
                    entries
                        .as_array()
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|entry| FunctionRecord::from_yellow_pages(class, entry))
                                .filter(|(serial, _, _)| *serial == self.serial)
                                .map(|(_, index, record)| (index, record))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                })
                .collect();
            mine.sort_by_key(|(index, _)| *index);
            renamed |= merge_functions(
                &mut state.functions,
                mine.into_iter().map(|(_, record)| record).collect(),
            );
        }

        // Per-function sections of a device-level fetch: diff logical
        // names and advertised values individually.
        for record in &mut state.functions {
            let Some(section) = api.get(&record.function_id) else {
                continue;
            };
            if let Some(name) = section.get("logicalName").and_then(Value::as_str) {
                if record.logical_name != name {
                    debug!(
                        serial = %self.serial,
                        function = %record.function_id,
                        name,
                        "function renamed"
                    );
                    record.logical_name = name.to_owned();
                    renamed = true;
                }
            }
            if let Some(value) = section.get("advertisedValue").and_then(Value::as_str) {
                record.advertised_value = value.to_owned();
            }
        }

        state.last_seen = Some(Utc::now());

        if first {
            RefreshOutcome::FirstSnapshot
        } else if renamed {
            RefreshOutcome::Renamed
        } else {
            RefreshOutcome::Updated
        }
    }

    /// Seed or diff the record from a hub enumeration (white pages entry
    /// plus this device's yellow-pages slice). Returns `true` when name
    /// resolution is affected; the session reindexes once per pass.
    pub(crate) fn apply_enumeration(
        &self,
        identity: DeviceIdentity,
        functions: Vec<FunctionRecord>,
    ) -> bool {
        let mut state = self.state.write().expect("device lock poisoned");
        let first = state.identity.is_none();
        let mut changed = Self::merge_identity(&mut state, identity, &self.serial);
        changed |= merge_functions(&mut state.functions, functions);
        state.last_seen = Some(Utc::now());
        first || changed
    }

    /// Merge identity fields; serial is immutable once observed.
    fn merge_identity(state: &mut DeviceData, incoming: DeviceIdentity, serial: &str) -> bool {
        if incoming.serial != serial {
            warn!(
                expected = serial,
                got = %incoming.serial,
                "ignoring snapshot with foreign serial"
            );
            return false;
        }
        match &mut state.identity {
            None => {
                state.identity = Some(incoming);
                false
            }
            Some(existing) => {
                let renamed = existing.logical_name != incoming.logical_name;
                if renamed {
                    debug!(%serial, name = %incoming.logical_name, "device renamed");
                }
                let index = if incoming.index == 0 {
                    existing.index
                } else {
                    incoming.index
                };
                *existing = DeviceIdentity { index, ..incoming };
                renamed
            }
        }
    }

    /// Run the directory rebuild hook synchronously.
    fn reindex_now(&self) {
        self.reindex_pending.store(true, Ordering::SeqCst);
        if let Some(hook) = self.reindex_hook.get() {
            hook();
            self.reindex_pending.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn clear_reindex_pending(&self) {
        self.reindex_pending.store(false, Ordering::SeqCst);
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.state
            .read()
            .expect("device lock poisoned")
            .identity
            .clone()
    }

    /// When this record last folded in a snapshot or enumeration.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("device lock poisoned").last_seen
    }

    pub fn logical_name(&self) -> String {
        self.identity().map(|i| i.logical_name).unwrap_or_default()
    }

    pub fn beacon(&self) -> bool {
        self.identity().is_some_and(|i| i.beacon)
    }

    pub fn function_count(&self) -> usize {
        self.state.read().expect("device lock poisoned").functions.len()
    }

    /// Function id at `index`; empty sentinel when out of range.
    pub fn function_id(&self, index: usize) -> String {
        self.with_function(index, |f| f.function_id.clone())
    }

    /// Function logical name at `index`; empty sentinel when out of range.
    pub fn function_name(&self, index: usize) -> String {
        self.with_function(index, |f| f.logical_name.clone())
    }

    /// Advertised value at `index`; empty sentinel when out of range.
    pub fn function_value(&self, index: usize) -> String {
        self.with_function(index, |f| f.advertised_value.clone())
    }

    /// Base type at `index`; plain `Function` when out of range.
    pub fn function_base_type(&self, index: usize) -> BaseType {
        self.state
            .read()
            .expect("device lock poisoned")
            .functions
            .get(index)
            .map(|f| f.base_type)
            .unwrap_or_default()
    }

    fn with_function(&self, index: usize, pick: impl Fn(&FunctionRecord) -> String) -> String {
        self.state
            .read()
            .expect("device lock poisoned")
            .functions
            .get(index)
            .map(pick)
            .unwrap_or_default()
    }

    /// A copy of the function table.
    pub fn functions(&self) -> Vec<FunctionRecord> {
        self.state
            .read()
            .expect("device lock poisoned")
            .functions
            .clone()
    }

    /// Stable lookup keys for the per-class function layer.
    pub fn function_keys(&self) -> Vec<FunctionKey> {
        self.state
            .read()
            .expect("device lock poisoned")
            .functions
            .iter()
            .map(|f| f.key(&self.serial))
            .collect()
    }

    /// Update a function's advertised value from a notification event.
    pub(crate) fn update_function_value(&self, function_id: &str, value: &str) {
        let mut state = self.state.write().expect("device lock poisoned");
        if let Some(record) = state
            .functions
            .iter_mut()
            .find(|f| f.function_id == function_id)
        {
            record.advertised_value = value.to_owned();
        }
    }

    // ── Attribute plumbing ───────────────────────────────────────────

    /// Read one function attribute through the cached API snapshot
    /// (refreshing it first when stale).
    pub async fn read_attribute(&self, function_id: &str, attr: &str) -> Result<String, CoreError> {
        let snapshot = match self.hub.request_api(&self.slot, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.record_error(e)),
        };

        snapshot
            .parsed
            .get(function_id)
            .and_then(|f| f.get(attr))
            .map(attribute_to_string)
            .ok_or_else(|| CoreError::Unresolved {
                name: format!("{}.{function_id}.{attr}", self.serial),
            })
    }

    /// Write one function attribute (`GET api/<fn>/<attr>?<attr>=<value>`)
    /// and drop the cache so the next read observes the mutation.
    pub async fn set_attribute(
        &self,
        function_id: &str,
        attr: &str,
        value: &str,
    ) -> Result<(), CoreError> {
        let rel = format!("{}api/{function_id}/{attr}", self.slot.device_path());
        self.hub
            .request_write(&rel, &[(attr, value)], None)
            .await
            .map_err(|e| self.record_error(e))?;

        self.slot.invalidate();
        Ok(())
    }

    // ── Log pulling ──────────────────────────────────────────────────

    /// Register the per-line device log callback.
    pub fn set_log_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.log_callback.lock().expect("log lock poisoned") = Some(Box::new(callback));
    }

    /// Current device log read position.
    pub fn log_position(&self) -> u64 {
        *self.log_position.lock().expect("log lock poisoned")
    }

    /// Pull new device log text since the last known position.
    ///
    /// Complete lines (terminated by the trailing `@<position>` marker)
    /// are fed to the registered callback; the position advances only on
    /// a well-formed tail. Reentrant calls while a pull is in flight are
    /// no-ops.
    pub async fn trigger_log_pull(&self) -> Result<(), CoreError> {
        if self.log_pulling.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = PullGuard(&self.log_pulling);

        let pos = self.log_position().to_string();
        let rel = format!("{}logs.txt", self.slot.device_path());
        let body = self
            .hub
            .request_bytes(&rel, &[("pos", &pos)], None)
            .await
            .map_err(|e| self.record_error(e))?;

        let text = String::from_utf8_lossy(&body);
        let Some((lines, new_pos)) = split_position_marker(&text) else {
            debug!(serial = %self.serial, "log tail without position marker, skipping");
            return Ok(());
        };

        {
            let callback = self.log_callback.lock().expect("log lock poisoned");
            if let Some(callback) = callback.as_ref() {
                for line in lines.split('\n').filter(|line| !line.is_empty()) {
                    callback(line);
                }
            }
        }
        *self.log_position.lock().expect("log lock poisoned") = new_pos;
        Ok(())
    }

    fn record_error(&self, e: yhub_api::Error) -> CoreError {
        let e = Arc::new(e);
        *self.last_error.lock().expect("error lock poisoned") = Some(Arc::clone(&e));
        CoreError::Api(e)
    }
}

/// Replace the function table, reporting whether name resolution is
/// affected (renames, or a composition change after a firmware update).
fn merge_functions(current: &mut Vec<FunctionRecord>, incoming: Vec<FunctionRecord>) -> bool {
    let mut renamed = false;
    if !current.is_empty() {
        for record in &incoming {
            match current.iter().find(|p| p.function_id == record.function_id) {
                Some(prev) => renamed |= prev.logical_name != record.logical_name,
                None => renamed = true,
            }
        }
        renamed |= current.len() != incoming.len();
    }
    *current = incoming;
    renamed
}

/// Clears the pull-in-flight flag even when the pull future is dropped.
struct PullGuard<'a>(&'a AtomicBool);

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Render a JSON attribute the way accessors expect it: bare strings,
/// everything else in its JSON form.
fn attribute_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
