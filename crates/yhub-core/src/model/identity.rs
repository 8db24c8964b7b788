// ── Device identity ──

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one physical/virtual module reachable through a hub.
///
/// The serial number is immutable once first observed; everything else
/// may change between refreshes (renames, beacon toggles).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub logical_name: String,
    pub product_name: String,
    pub product_id: u32,
    /// Localization beacon currently blinking.
    pub beacon: bool,
    /// Hub-relative device index from the white pages.
    pub index: u32,
}

impl DeviceIdentity {
    /// Build from a `module` section of a device API structure.
    pub fn from_module(module: &Value) -> Option<Self> {
        let serial = module.get("serialNumber")?.as_str()?.to_owned();
        Some(Self {
            serial,
            logical_name: str_field(module, "logicalName"),
            product_name: str_field(module, "productName"),
            product_id: u32_field(module, "productId"),
            beacon: u32_field(module, "beacon") != 0,
            index: 0,
        })
    }

    /// Build from one white-pages entry of a hub enumeration.
    pub fn from_white_pages(entry: &Value) -> Option<Self> {
        let mut identity = Self::from_module(entry)?;
        identity.index = u32_field(entry, "index");
        Some(identity)
    }

    /// The name callers address the device by: logical name when set,
    /// serial otherwise.
    pub fn friendly_name(&self) -> &str {
        if self.logical_name.is_empty() {
            &self.serial
        } else {
            &self.logical_name
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn u32_field(value: &Value, key: &str) -> u32 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or_default()
}
