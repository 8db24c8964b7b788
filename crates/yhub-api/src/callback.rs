// HTTP-callback ("cache") mode
//
// A hub behind NAT cannot be polled; instead it periodically POSTs its
// full state to a listener in this process. Each accepted POST replaces
// the whole path-keyed snapshot atomically -- a reader either sees the
// previous snapshot or the new one, never a half-merged state. Writes
// addressed to such a hub are queued store-and-forward for the hub to
// collect on its next poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::digest::md5_hex_bytes;
use crate::error::Error;
use crate::jzon::{self, ReferenceStore};

/// User agents accepted on inbound callback POSTs.
fn user_agent_is_hub(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua == "virtualhub" || ua.starts_with("yoctohub")
}

/// The parts of an inbound HTTP request callback validation needs.
/// The embedding HTTP server (out of scope here) maps its request type
/// onto this.
#[derive(Debug, Clone, Copy)]
pub struct InboundPost<'a> {
    pub method: &'a str,
    pub content_type: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub body: &'a [u8],
}

/// Read-only state cache for one callback-mode hub.
pub struct CallbackCache {
    password: Option<SecretString>,
    /// Whole snapshot replaced atomically per accepted POST.
    snapshot: ArcSwap<HashMap<String, Arc<Value>>>,
    pending_writes: StdMutex<Vec<String>>,
    jzon_refs: Arc<ReferenceStore>,
}

impl CallbackCache {
    pub fn new(password: Option<SecretString>, jzon_refs: Arc<ReferenceStore>) -> Self {
        Self {
            password,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            pending_writes: StdMutex::new(Vec::new()),
            jzon_refs,
        }
    }

    // ── Ingestion ────────────────────────────────────────────────────

    /// Validate and apply one inbound callback POST.
    ///
    /// Validation: method must be POST, content type `application/json`,
    /// user agent a recognized hub. When a callback password is
    /// configured the body must carry a valid `sign` field (see
    /// [`verify_signature`]); a missing or wrong signature is an
    /// [`Error::Authentication`]. A valid post replaces the snapshot
    /// atomically.
    pub fn ingest(&self, post: &InboundPost<'_>) -> Result<(), Error> {
        if !post.method.eq_ignore_ascii_case("POST") {
            return Err(Error::protocol(format!(
                "callback must be a POST, got {}",
                post.method
            )));
        }
        if !post
            .content_type
            .is_some_and(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
        {
            return Err(Error::protocol("callback content-type is not application/json".to_owned()));
        }
        if !post.user_agent.is_some_and(user_agent_is_hub) {
            return Err(Error::protocol(format!(
                "unrecognized callback user-agent {:?}",
                post.user_agent.unwrap_or("")
            )));
        }

        if let Some(password) = &self.password {
            verify_signature(post.body, password)?;
        }

        let parsed: Value = serde_json::from_slice(post.body).map_err(|e| {
            Error::protocol(format!("callback body is not valid JSON: {e}"))
        })?;
        let Value::Object(entries) = parsed else {
            return Err(Error::protocol("callback body is not a JSON object".to_owned()));
        };

        let mut cache = HashMap::with_capacity(entries.len());
        for (path, value) in entries {
            if !path.starts_with('/') {
                // Metadata fields (serial, sign, ...) travel alongside the
                // sub-request entries; they are not cacheable paths.
                continue;
            }
            match self.decode_entry(&path, value) {
                Some(decoded) => {
                    cache.insert(path, Arc::new(decoded));
                }
                None => {
                    warn!(%path, "skipping undecodable callback entry");
                }
            }
        }

        debug!(entries = cache.len(), "applied callback snapshot");
        self.snapshot.store(Arc::new(cache));
        Ok(())
    }

    /// Decode one posted sub-entry.
    ///
    /// JZON-compacted entries arrive wrapped as
    /// `{"fw": "<release>", "jzon": <compact>}` and expand against the
    /// persisted reference for the device's firmware; entries without a
    /// usable reference (or failing the firmware check) are dropped for
    /// this snapshot. Canonical entries refresh the reference store.
    fn decode_entry(&self, path: &str, value: Value) -> Option<Value> {
        let Some(wrapper) = value.as_object() else {
            return Some(value);
        };

        let (Some(fw), Some(compact)) = (
            wrapper.get("fw").and_then(Value::as_str),
            wrapper.get("jzon"),
        ) else {
            if value.get("module").is_some() {
                self.jzon_refs.store_canonical(&value);
            }
            return Some(value);
        };

        let base = serial_base_from_path(path)?;
        let reference = self.jzon_refs.lookup(base, fw)?;
        match jzon::expand(compact, &reference)
            .and_then(|decoded| jzon::verify_firmware(&decoded, &reference).map(|()| decoded))
        {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(%path, error = %e, "callback jzon entry rejected");
                self.jzon_refs.mark_untrusted(base, fw);
                None
            }
        }
    }

    // ── Reads & writes ───────────────────────────────────────────────

    /// Look up a sub-request path (e.g. `/bySerial/<serial>/api.json`)
    /// in the current snapshot.
    pub fn get(&self, path: &str) -> Option<Arc<Value>> {
        self.snapshot.load().get(path).map(Arc::clone)
    }

    /// Number of cached sub-request paths.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Queue a write request for the hub to collect on its next poll.
    pub fn queue_write(&self, request_uri: String) {
        debug!(%request_uri, "queueing store-and-forward write");
        self.pending_writes
            .lock()
            .expect("write queue lock poisoned")
            .push(request_uri);
    }

    /// Drain everything queued since the last poll.
    pub fn drain_pending_writes(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .pending_writes
                .lock()
                .expect("write queue lock poisoned"),
        )
    }
}

// ── Signature validation ─────────────────────────────────────────────

/// Validate the embedded callback signature.
///
/// The hub computes `sign = md5(body with the sign value replaced by the
/// shared secret)`; the secret itself is used verbatim when it is already
/// 32 hex chars, `md5(secret)` otherwise. Verification re-runs the same
/// substitution locally and compares lowercase digests.
fn verify_signature(body: &[u8], password: &SecretString) -> Result<(), Error> {
    let (sign_start, sign_len) = find_sign_value(body).ok_or_else(|| Error::Authentication {
        message: "callback password is set but the POST carries no signature".to_owned(),
    })?;
    let claimed = String::from_utf8_lossy(&body[sign_start..sign_start + sign_len]).to_lowercase();

    let secret = password.expose_secret();
    let key = if is_hex32(secret) {
        secret.to_owned()
    } else {
        md5_hex_bytes(secret.as_bytes())
    };

    let mut salted = Vec::with_capacity(body.len());
    salted.extend_from_slice(&body[..sign_start]);
    salted.extend_from_slice(key.as_bytes());
    salted.extend_from_slice(&body[sign_start + sign_len..]);

    if md5_hex_bytes(&salted) == claimed {
        Ok(())
    } else {
        Err(Error::Authentication {
            message: "callback signature mismatch".to_owned(),
        })
    }
}

/// Locate the value of the `"sign"` field in the raw body.
/// Returns (byte offset, length) of the quoted value.
fn find_sign_value(body: &[u8]) -> Option<(usize, usize)> {
    let text = String::from_utf8_lossy(body);
    let field = text.find("\"sign\"")?;
    let colon = field + text[field..].find(':')?;
    let open = colon + text[colon..].find('"')?;
    let value_start = open + 1;
    let value_len = text[value_start..].find('"')?;
    Some((value_start, value_len))
}

fn is_hex32(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn serial_base_from_path(path: &str) -> Option<&str> {
    let serial = path.strip_prefix("/bySerial/")?;
    let serial = &serial[..serial.find('/')?];
    Some(jzon::serial_base(serial))
}

// ── Tests ────────────────────────────────────────────────────────────
