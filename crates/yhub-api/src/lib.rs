// yhub-api: Async Rust client for the Yoctopuce hub HTTP API

pub mod callback;
pub mod digest;
pub mod error;
pub mod hub;
pub mod jzon;
pub mod notification;
pub mod transport;

pub use error::Error;
pub use hub::{ApiCacheSlot, ApiSnapshot, HubConnection, HubMode};
pub use transport::{TlsMode, TransportConfig};
