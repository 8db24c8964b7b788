// Session configuration
//
// Defaults match the hub firmware's expectations: the API cache is
// effectively revalidate-always (5 ms) unless a caller opts into longer
// staleness, and the device list is re-enumerated at most every 10 s.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use yhub_api::TlsMode;
use yhub_api::transport::DEFAULT_NETWORK_TIMEOUT;

/// Default validity of a device's cached API snapshot.
pub const DEFAULT_CACHE_VALIDITY: Duration = Duration::from_millis(5);

/// Default validity of the hub-wide device list between enumerations.
pub const DEFAULT_DEVICE_LIST_VALIDITY: Duration = Duration::from_secs(10);

/// Credentials for one hub.
#[derive(Debug, Clone)]
pub struct HubCredentials {
    pub user: String,
    pub password: SecretString,
}

/// Session-wide configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a cached device API snapshot stays valid. Soft TTL:
    /// reads within the window never touch the network.
    pub cache_validity: Duration,

    /// How long an enumeration result stays valid. Soft TTL.
    pub device_list_validity: Duration,

    /// Default per-request network timeout.
    pub network_timeout: Duration,

    /// TLS trust policy for hub connections.
    pub tls: TlsMode,

    /// Shared secret for validating inbound callback POSTs.
    pub callback_password: Option<SecretString>,

    /// Where to persist JZON reference templates; `None` keeps them
    /// in memory only.
    pub reference_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_validity: DEFAULT_CACHE_VALIDITY,
            device_list_validity: DEFAULT_DEVICE_LIST_VALIDITY,
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
            tls: TlsMode::default(),
            callback_password: None,
            reference_dir: None,
        }
    }
}
