use std::sync::Arc;

use thiserror::Error;

/// Top-level error type for the `yhub-core` crate.
///
/// Transport and protocol failures from `yhub-api` are carried behind an
/// `Arc` so the same underlying error can be returned to the caller *and*
/// retained on the device record for later inspection
/// ([`DeviceEntry::last_error`](crate::device::DeviceEntry::last_error)).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A hub transport/protocol error.
    #[error("{0}")]
    Api(Arc<yhub_api::Error>),

    /// No hub is registered under this URL.
    #[error("No hub registered at {url}")]
    UnknownHub { url: String },

    /// A device or function name did not resolve to anything known.
    #[error("Cannot resolve `{name}`")]
    Unresolved { name: String },

    /// Hub URL could not be parsed.
    #[error("Invalid hub URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<yhub_api::Error> for CoreError {
    fn from(e: yhub_api::Error) -> Self {
        Self::Api(Arc::new(e))
    }
}

impl From<Arc<yhub_api::Error>> for CoreError {
    fn from(e: Arc<yhub_api::Error>) -> Self {
        Self::Api(e)
    }
}

impl CoreError {
    /// The underlying API error, if this is one.
    pub fn api_error(&self) -> Option<&yhub_api::Error> {
        match self {
            Self::Api(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if retrying later might succeed (transient
    /// transport conditions, timeouts).
    pub fn is_transient(&self) -> bool {
        self.api_error().is_some_and(yhub_api::Error::is_transient)
    }
}
