// HTTP transport configuration
//
// Builds the `reqwest::Client` every hub connection shares. Hubs on a LAN
// frequently present self-signed certificates, so TLS trust is explicit
// configuration rather than an afterthought.

use std::time::Duration;

use crate::error::Error;

/// Default network timeout applied when the caller does not supply one.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(20);

/// TLS trust policy for hub connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Full certificate verification (default).
    #[default]
    Strict,
    /// Accept invalid/self-signed certificates. Common for VirtualHub
    /// instances on a LAN; never use this across untrusted networks.
    AcceptInvalid,
}

/// Transport-level configuration shared by all requests to a hub.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout unless the caller overrides it.
    pub timeout: Duration,
    /// TLS trust policy.
    pub tls: TlsMode,
    /// `User-Agent` header sent on every request.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_NETWORK_TIMEOUT,
            tls: TlsMode::default(),
            user_agent: format!("yhub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransportConfig {
    /// Build a configured `reqwest::Client`.
    ///
    /// No global client timeout is set here -- per-request deadlines are
    /// enforced by the hub connection so a timed-out request can release
    /// its single-flight slot with a precise [`Error::Timeout`].
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().user_agent(self.user_agent.clone());

        if self.tls == TlsMode::AcceptInvalid {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(Error::Transport)
    }
}
