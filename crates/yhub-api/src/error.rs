use thiserror::Error;

/// Top-level error type for the `yhub-api` crate.
///
/// Covers every failure mode across the hub transport: authentication,
/// HTTP transport, protocol-level decoding (including JZON), and the
/// notification stream. `yhub-core` maps these into directory-level
/// diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Digest challenge could not be satisfied, callback signature was
    /// invalid, or the hub rejected the credentials.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request exceeded the caller-supplied timeout.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Protocol ────────────────────────────────────────────────────
    /// The hub sent something structurally wrong: malformed JSON where
    /// JSON was required, a JZON diff that does not match its reference,
    /// or a notification batch without its position marker.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Directory ───────────────────────────────────────────────────
    /// A referenced serial is no longer resolvable through any hub.
    #[error("Device not found: {serial}")]
    DeviceNotFound { serial: String },

    /// The hub refuses state changes (write-protected).
    #[error("Hub is write-protected: {message}")]
    WriteProtected { message: String },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if this error indicates missing or rejected
    /// credentials (re-authenticating with different ones might resolve it).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Returns `true` for structural protocol failures (malformed JSON,
    /// JZON mismatch, missing notification marker).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Deserialization { .. }
        )
    }
}
