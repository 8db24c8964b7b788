// HTTP Digest authentication (RFC 2617, qop=auth)
//
// Hubs answer unauthenticated requests on protected resources with a 401
// carrying a `WWW-Authenticate: Digest ...` challenge. State is per hub:
// one realm session at a time, nonce-count strictly increasing while the
// session lasts.

use md5::{Digest as _, Md5};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};

/// MD5 over raw bytes, lowercase hex. Shared with callback signature
/// validation.
pub(crate) fn md5_hex_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 over the `:`-joined parts, lowercase hex.
fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Digest-auth session state for one hub.
///
/// Empty until the hub issues a challenge; refreshed whenever the server
/// sends a new nonce. With no credentials configured every request stays
/// anonymous ([`build_authorization`](Self::build_authorization) returns
/// `None`).
#[derive(Debug)]
pub struct DigestAuth {
    user: String,
    password: SecretString,
    realm: Option<String>,
    nonce: String,
    opaque: Option<String>,
    /// `md5(user:realm:password)`; recomputed only when the realm changes.
    ha1: String,
    nonce_count: u32,
}

impl DigestAuth {
    /// Create auth state for the given credentials. An empty user name
    /// means anonymous access -- no header is ever produced.
    pub fn new(user: impl Into<String>, password: SecretString) -> Self {
        Self {
            user: user.into(),
            password,
            realm: None,
            nonce: String::new(),
            opaque: None,
            ha1: String::new(),
            nonce_count: 0,
        }
    }

    /// Anonymous state (no credentials configured).
    pub fn anonymous() -> Self {
        Self::new(String::new(), SecretString::from(String::new()))
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty()
    }

    /// `true` once a challenge has been recorded.
    pub fn has_challenge(&self) -> bool {
        self.realm.is_some()
    }

    /// Record a `WWW-Authenticate` challenge.
    ///
    /// Extracts `realm`, `nonce` and `opaque`, resets the nonce count and
    /// recomputes ha1 when the realm changed. Malformed challenges (not a
    /// Digest scheme, or missing realm/nonce) are ignored and prior state
    /// is kept.
    pub fn on_challenge(&mut self, header: &str) {
        let Some(params) = header.trim().strip_prefix_ignore_case("Digest") else {
            trace!("ignoring non-Digest challenge");
            return;
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        for (key, value) in parse_auth_params(params) {
            match key {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                _ => {}
            }
        }

        let (Some(realm), Some(nonce)) = (realm, nonce) else {
            trace!("ignoring malformed Digest challenge (no realm/nonce)");
            return;
        };

        if self.realm.as_deref() != Some(realm) {
            self.ha1 = md5_hex(&[&self.user, realm, self.password.expose_secret()]);
            self.realm = Some(realm.to_owned());
        }
        self.nonce = nonce.to_owned();
        self.opaque = opaque.map(str::to_owned);
        self.nonce_count = 0;
        debug!(realm, "recorded Digest challenge");
    }

    /// Build an `Authorization` value for the given request line.
    ///
    /// `None` when no challenge has been recorded yet or no credentials
    /// are configured (anonymous request). Each call increments the nonce
    /// count and draws a fresh client nonce.
    pub fn build_authorization(&mut self, method: &str, uri: &str) -> Option<String> {
        if !self.has_credentials() {
            return None;
        }
        let realm = self.realm.as_deref()?;

        self.nonce_count += 1;
        let cnonce = format!("{:016x}", rand::random::<u64>());
        let response = self.compute_response(method, uri, self.nonce_count, &cnonce);

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{}\", uri=\"{uri}\", \
             qop=auth, nc={:08x}, cnonce=\"{cnonce}\", response=\"{response}\"",
            self.user, self.nonce, self.nonce_count,
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        Some(header)
    }

    /// `response = md5(ha1:nonce:nc:cnonce:auth:md5(method:uri))`
    fn compute_response(&self, method: &str, uri: &str, nc: u32, cnonce: &str) -> String {
        let ha2 = md5_hex(&[method, uri]);
        md5_hex(&[
            &self.ha1,
            &self.nonce,
            &format!("{nc:08x}"),
            cnonce,
            "auth",
            &ha2,
        ])
    }
}

/// Parse `key="value"` / `key=value` pairs from a challenge parameter list.
fn parse_auth_params(params: &str) -> impl Iterator<Item = (&str, &str)> {
    params.split(',').filter_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        let value = value.trim().trim_matches('"');
        Some((key.trim(), value))
    })
}

/// Case-insensitive prefix strip for the auth scheme token.
trait StripPrefixIgnoreCase {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str>;
}

impl StripPrefixIgnoreCase for str {
    fn strip_prefix_ignore_case<'a>(&'a self, prefix: &str) -> Option<&'a str> {
        if self.len() >= prefix.len() && self[..prefix.len()].eq_ignore_ascii_case(prefix) {
            Some(&self[prefix.len()..])
        } else {
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
