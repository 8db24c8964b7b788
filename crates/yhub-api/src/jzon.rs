// JZON differential JSON codec
//
// Hubs avoid re-sending unchanged JSON structure: once a client has seen a
// canonical `api.json` for a given firmware release, later fetches can
// request a compacted form where objects collapse to positional arrays.
// Expansion walks a reference template of the same shape and restores the
// key structure; the reference keeps only `serialNumber` (truncated to the
// serial base) and `firmwareRelease` so a stale template is detectable.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::Error;

/// Length of the model prefix of a serial number (`YHUBETH1-10245A` -> `YHUBETH1`).
pub const SERIAL_BASE_LEN: usize = 8;

/// The model prefix of a serial number, used to key reference templates.
pub fn serial_base(serial: &str) -> &str {
    let end = serial.find('-').unwrap_or(serial.len()).min(SERIAL_BASE_LEN);
    &serial[..end]
}

// ── Expansion ────────────────────────────────────────────────────────

/// Expand a JZON-compacted structure against a reference template.
///
/// The walk follows the reference: object keys are matched in the input by
/// name when the input kept them, by position otherwise; arrays recurse
/// element-wise; scalar leaves copy straight from the input. The `services`
/// key expands specially (white pages / yellow pages, see
/// [`expand_services`]).
pub fn expand(compact: &Value, reference: &Value) -> Result<Value, Error> {
    match reference {
        Value::Object(ref_map) => {
            let mut out = Map::with_capacity(ref_map.len());
            for (idx, (key, ref_child)) in ref_map.iter().enumerate() {
                let input_child = pick_child(compact, key, idx).ok_or_else(|| {
                    Error::protocol(format!("jzon structure mismatch: no value for `{key}`"))
                })?;
                let value = if key == "services" {
                    expand_services(input_child, ref_child)?
                } else {
                    expand(input_child, ref_child)?
                };
                out.insert(key.clone(), value);
            }
            Ok(Value::Object(out))
        }
        Value::Array(ref_items) => {
            let input_items = compact.as_array().ok_or_else(|| {
                Error::protocol("jzon structure mismatch: expected array".to_owned())
            })?;
            let mut out = Vec::with_capacity(input_items.len());
            for (idx, item) in input_items.iter().enumerate() {
                // Past the reference's length, reuse its first element as
                // the per-item template (homogeneous lists).
                let template = ref_items
                    .get(idx)
                    .or_else(|| ref_items.first())
                    .unwrap_or(&Value::Null);
                out.push(expand(item, template)?);
            }
            Ok(Value::Array(out))
        }
        // Scalar leaf: the compact form carries the value verbatim.
        _ => Ok(compact.clone()),
    }
}

/// Select the input value for a reference key: by name if the input kept
/// its object form, by position if it was compacted to an array.
fn pick_child<'a>(compact: &'a Value, key: &str, idx: usize) -> Option<&'a Value> {
    match compact {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(idx),
        _ => None,
    }
}

/// Expand the `services` section.
///
/// The compact form is an ordered pair `[whitePages, yellowPages]`. White
/// pages entries all decode against the reference's first white-pages
/// entry; yellow pages is a map from function class to entry lists, every
/// entry decoding against the first yellow-pages entry found in the
/// reference (all classes share one shape).
fn expand_services(compact: &Value, reference: &Value) -> Result<Value, Error> {
    let (wp_in, yp_in) = match compact {
        Value::Array(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
        // Not compacted after all -- pass through the object form.
        Value::Object(_) => return Ok(compact.clone()),
        _ => {
            return Err(Error::protocol(
                "jzon structure mismatch: services is not a [whitePages, yellowPages] pair"
                    .to_owned(),
            ));
        }
    };

    let wp_template = reference
        .get("whitePages")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or_else(|| Error::protocol("jzon reference has no whitePages template".to_owned()))?;
    let yp_template = reference
        .get("yellowPages")
        .and_then(Value::as_object)
        .and_then(|classes| {
            classes
                .values()
                .find_map(|v| v.as_array().and_then(|a| a.first()))
        })
        .ok_or_else(|| Error::protocol("jzon reference has no yellowPages template".to_owned()))?;

    let wp_entries = wp_in
        .as_array()
        .ok_or_else(|| Error::protocol("jzon whitePages is not an array".to_owned()))?;
    let mut white_pages = Vec::with_capacity(wp_entries.len());
    for entry in wp_entries {
        white_pages.push(expand(entry, wp_template)?);
    }

    let yp_classes = yp_in
        .as_object()
        .ok_or_else(|| Error::protocol("jzon yellowPages is not an object".to_owned()))?;
    let mut yellow_pages = Map::with_capacity(yp_classes.len());
    for (class, entries) in yp_classes {
        let entries = entries.as_array().ok_or_else(|| {
            Error::protocol(format!("jzon yellowPages class `{class}` is not a list"))
        })?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(expand(entry, yp_template)?);
        }
        yellow_pages.insert(class.clone(), Value::Array(out));
    }

    let mut services = Map::with_capacity(2);
    services.insert("whitePages".to_owned(), Value::Array(white_pages));
    services.insert("yellowPages".to_owned(), Value::Object(yellow_pages));
    Ok(Value::Object(services))
}

/// Check that an expanded structure matches its reference's firmware.
///
/// A diff can only be decoded against a reference from the same firmware
/// release; a mismatch means the reference is stale and the caller must
/// fall back to a canonical (non-differential) fetch.
pub fn verify_firmware(decoded: &Value, reference: &Value) -> Result<(), Error> {
    let got = firmware_release(decoded);
    let expected = firmware_release(reference);
    if got == expected {
        Ok(())
    } else {
        Err(Error::protocol(format!(
            "jzon firmware mismatch: decoded `{}` but reference is `{}`",
            got.unwrap_or(""),
            expected.unwrap_or(""),
        )))
    }
}

/// `module.firmwareRelease` of a full device API structure.
pub fn firmware_release(api: &Value) -> Option<&str> {
    api.get("module")?.get("firmwareRelease")?.as_str()
}

// ── Reference derivation ─────────────────────────────────────────────

/// Derive a reference template from a canonical device API structure.
///
/// Every scalar leaf is blanked, except `serialNumber` values (kept,
/// truncated to the serial base) and `firmwareRelease` (kept verbatim so
/// stale references are detectable at decode time).
pub fn make_reference(full: &Value) -> Value {
    blank(full, None)
}

fn blank(value: &Value, key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), blank(v, Some(k))))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| blank(v, key)).collect()),
        other => match key {
            Some("serialNumber") => {
                let serial = other.as_str().unwrap_or("");
                Value::String(serial_base(serial).to_owned())
            }
            Some("firmwareRelease") => other.clone(),
            _ => Value::String(String::new()),
        },
    }
}

// ── Reference store ──────────────────────────────────────────────────

/// Cache of reference templates, keyed by `(serial base, firmware release)`.
///
/// Optionally persisted to disk, one file per
/// `<serial-base>_<sanitized-firmware>.json`. On a firmware mismatch the
/// disk file is left in place but the key is marked untrusted in memory;
/// the next canonical fetch re-derives the template and clears the mark.
pub struct ReferenceStore {
    dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Arc<Value>>>,
    untrusted: Mutex<HashSet<String>>,
}

impl ReferenceStore {
    /// In-memory store (no persistence).
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            cache: Mutex::new(HashMap::new()),
            untrusted: Mutex::new(HashSet::new()),
        }
    }

    /// Store persisting templates under `dir` (created on first write).
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::in_memory()
        }
    }

    fn key(base: &str, firmware: &str) -> String {
        format!("{base}_{}", sanitize_firmware(firmware))
    }

    /// Derive and retain the reference for a canonical API structure.
    ///
    /// Clears any untrusted mark for the key. Disk persistence is
    /// best-effort: an IO failure is logged and the in-memory template is
    /// kept regardless.
    pub fn store_canonical(&self, full: &Value) {
        let Some(serial) = full
            .get("module")
            .and_then(|m| m.get("serialNumber"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let Some(firmware) = firmware_release(full) else {
            return;
        };

        let key = Self::key(serial_base(serial), firmware);
        let reference = Arc::new(make_reference(full));

        if let Some(dir) = &self.dir {
            if let Err(e) = std::fs::create_dir_all(dir)
                .and_then(|()| std::fs::write(dir.join(format!("{key}.json")), reference.to_string()))
            {
                warn!(%key, error = %e, "failed to persist jzon reference");
            }
        }

        self.untrusted.lock().expect("reference lock poisoned").remove(&key);
        self.cache
            .lock()
            .expect("reference lock poisoned")
            .insert(key.clone(), reference);
        debug!(%key, "stored jzon reference");
    }

    /// Look up a usable reference. Untrusted keys resolve to `None` until
    /// a canonical fetch re-derives them.
    pub fn lookup(&self, base: &str, firmware: &str) -> Option<Arc<Value>> {
        let key = Self::key(base, firmware);
        if self
            .untrusted
            .lock()
            .expect("reference lock poisoned")
            .contains(&key)
        {
            return None;
        }

        if let Some(found) = self
            .cache
            .lock()
            .expect("reference lock poisoned")
            .get(&key)
        {
            return Some(Arc::clone(found));
        }

        // Fall back to disk.
        let dir = self.dir.as_ref()?;
        let text = std::fs::read_to_string(dir.join(format!("{key}.json"))).ok()?;
        let parsed: Value = serde_json::from_str(&text).ok()?;
        let reference = Arc::new(parsed);
        self.cache
            .lock()
            .expect("reference lock poisoned")
            .insert(key, Arc::clone(&reference));
        Some(reference)
    }

    /// Mark a key untrusted after a firmware mismatch. The disk file is
    /// left untouched; only a fresh canonical fetch clears the mark.
    pub fn mark_untrusted(&self, base: &str, firmware: &str) {
        let key = Self::key(base, firmware);
        warn!(%key, "marking jzon reference untrusted");
        self.cache
            .lock()
            .expect("reference lock poisoned")
            .remove(&key);
        self.untrusted
            .lock()
            .expect("reference lock poisoned")
            .insert(key);
    }
}

/// Make a firmware release string safe for use in a file name.
fn sanitize_firmware(firmware: &str) -> String {
    firmware
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────
