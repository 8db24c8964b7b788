// ── Function domain types ──

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Base behavior class of a function, from the yellow pages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[non_exhaustive]
pub enum BaseType {
    /// Plain attribute holder (relays, displays, ...).
    #[default]
    Function,
    /// Measuring function with a current value and unit.
    Sensor,
}

impl BaseType {
    /// Lenient parse: anything unrecognized is a plain function.
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// `<serial>.<functionId>` -- the globally unique address of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(String);

impl HardwareId {
    pub fn new(serial: &str, function_id: &str) -> Self {
        Self(format!("{serial}.{function_id}"))
    }

    /// Parse from the wire form; requires the `<serial>.<functionId>` dot.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.contains('.').then(|| Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn serial(&self) -> &str {
        self.0.split_once('.').map_or("", |(serial, _)| serial)
    }

    pub fn function_id(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, id)| id)
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stable identity-cache key for the per-class function layer:
/// one wrapper instance exists per `(class, hardware id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionKey {
    pub class: String,
    pub hardware_id: HardwareId,
}

/// One row of a device's function table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Hardware id suffix on the device (`relay1`, `temperature`, ...).
    pub function_id: String,
    /// Function class from the yellow pages (`Relay`, `Temperature`, ...).
    pub class: String,
    pub logical_name: String,
    pub advertised_value: String,
    pub base_type: BaseType,
}

impl FunctionRecord {
    /// Decode one yellow-pages entry.
    ///
    /// Returns `(owner serial, device-relative index, record)`; `None`
    /// for entries without a well-formed hardware id.
    pub fn from_yellow_pages(class: &str, entry: &Value) -> Option<(String, u32, Self)> {
        let hardware_id = HardwareId::parse(entry.get("hardwareId")?.as_str()?)?;
        let index = entry
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_default();

        let record = Self {
            function_id: hardware_id.function_id().to_owned(),
            class: class.to_owned(),
            logical_name: entry
                .get("logicalName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            advertised_value: entry
                .get("advertisedValue")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            base_type: entry
                .get("baseType")
                .and_then(Value::as_str)
                .map(BaseType::parse)
                .unwrap_or_default(),
        };
        Some((hardware_id.serial().to_owned(), index, record))
    }

    pub fn hardware_id(&self, serial: &str) -> HardwareId {
        HardwareId::new(serial, &self.function_id)
    }

    pub fn key(&self, serial: &str) -> FunctionKey {
        FunctionKey {
            class: self.class.clone(),
            hardware_id: self.hardware_id(serial),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hardware_id_splits_serial_and_function() {
        let id = HardwareId::new("RELAYLO1-201D2", "relay1");
        assert_eq!(id.as_str(), "RELAYLO1-201D2.relay1");
        assert_eq!(id.serial(), "RELAYLO1-201D2");
        assert_eq!(id.function_id(), "relay1");
    }

    #[test]
    fn hardware_id_requires_a_dot() {
        assert!(HardwareId::parse("RELAYLO1-201D2.relay1").is_some());
        assert!(HardwareId::parse("not-a-hardware-id").is_none());
    }

    #[test]
    fn base_type_parses_leniently() {
        assert_eq!(BaseType::parse("Sensor"), BaseType::Sensor);
        assert_eq!(BaseType::parse("Function"), BaseType::Function);
        assert_eq!(BaseType::parse("SomethingNew"), BaseType::Function);
    }

    #[test]
    fn yellow_pages_entry_decodes() {
        let entry = json!({
            "hardwareId": "RELAYLO1-201D2.relay1",
            "logicalName": "door",
            "advertisedValue": "A",
            "index": 3
        });

        let (serial, index, record) = FunctionRecord::from_yellow_pages("Relay", &entry).unwrap();
        assert_eq!(serial, "RELAYLO1-201D2");
        assert_eq!(index, 3);
        assert_eq!(record.function_id, "relay1");
        assert_eq!(record.class, "Relay");
        assert_eq!(record.logical_name, "door");
        assert_eq!(record.advertised_value, "A");
        assert_eq!(record.base_type, BaseType::Function);
    }

    #[test]
    fn malformed_yellow_pages_entry_is_skipped() {
        assert!(FunctionRecord::from_yellow_pages("Relay", &json!({"index": 1})).is_none());
        assert!(
            FunctionRecord::from_yellow_pages("Relay", &json!({"hardwareId": "nodot"})).is_none()
        );
    }
}
