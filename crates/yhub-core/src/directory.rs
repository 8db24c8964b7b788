// ── Name-resolution index ──
//
// Concurrent lookup tables from user-facing names (serials, logical
// names, `device.function` pairs) to stable function keys. Rebuilt
// eagerly whenever a device reports an identity change: a stale table
// could resolve a name to a function on the wrong physical device.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::{FunctionKey, FunctionRecord};

/// One device's slice of the index.
#[derive(Debug, Clone)]
pub struct IndexedDevice {
    pub serial: String,
    pub logical_name: String,
    pub functions: Vec<FunctionRecord>,
}

/// Session-wide resolution tables.
///
/// Rebuilds use upsert-then-prune so concurrent readers never observe a
/// briefly-empty table. Every rebuild bumps a version observable through
/// [`subscribe`](Self::subscribe).
pub struct ResolutionIndex {
    /// Primary table: serial -> indexed device.
    devices: DashMap<String, Arc<IndexedDevice>>,

    /// Secondary index: device logical name -> serial.
    device_by_name: DashMap<String, String>,

    /// Version counter, bumped on every rebuild.
    version: watch::Sender<u64>,
}

impl Default for ResolutionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionIndex {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            devices: DashMap::new(),
            device_by_name: DashMap::new(),
            version,
        }
    }

    /// Replace the index contents.
    ///
    /// Incoming devices are upserted first, then stale keys pruned, so
    /// lookups racing a rebuild see either the old or the new mapping --
    /// never nothing.
    pub fn rebuild(&self, incoming: Vec<IndexedDevice>) {
        let serials: HashSet<String> = incoming.iter().map(|d| d.serial.clone()).collect();

        for device in incoming {
            if !device.logical_name.is_empty() {
                self.device_by_name
                    .insert(device.logical_name.clone(), device.serial.clone());
            }
            self.devices
                .insert(device.serial.clone(), Arc::new(device));
        }

        self.devices.retain(|serial, _| serials.contains(serial));
        self.device_by_name.retain(|name, serial| {
            self.devices
                .get(serial)
                .is_some_and(|device| device.logical_name == *name)
        });

        self.version.send_modify(|v| *v += 1);
    }

    /// Resolve a device reference (serial or logical name) to its serial.
    pub fn resolve_device(&self, name: &str) -> Option<String> {
        if self.devices.contains_key(name) {
            return Some(name.to_owned());
        }
        self.device_by_name.get(name).map(|r| r.value().clone())
    }

    /// Resolve a function reference to its stable key.
    ///
    /// Accepted forms: `<device>.<function>` (device = serial or logical
    /// name, function = hardware id suffix or logical name) or a bare
    /// function logical name, searched across all devices.
    pub fn resolve_function(&self, name: &str) -> Option<FunctionKey> {
        if let Some((device, function)) = name.split_once('.') {
            let serial = self.resolve_device(device)?;
            let entry = self.devices.get(&serial)?;
            return entry
                .functions
                .iter()
                .find(|f| f.function_id == function || f.logical_name == function)
                .map(|f| f.key(&serial));
        }

        // Bare function logical name: first match wins.
        self.devices.iter().find_map(|entry| {
            entry
                .value()
                .functions
                .iter()
                .find(|f| !f.logical_name.is_empty() && f.logical_name == name)
                .map(|f| f.key(&entry.value().serial))
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All indexed serials.
    pub fn serials(&self) -> Vec<String> {
        self.devices.iter().map(|r| r.key().clone()).collect()
    }

    /// Subscribe to rebuild notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
