//! Device directory and session layer for Yoctopuce hubs.
//!
//! This crate owns the directory logic of the yhub workspace, built on
//! the transport primitives of [`yhub_api`]:
//!
//! - **[`Session`]** — registry of hubs and devices. No process-wide
//!   singletons: every cache and lookup table hangs off a session object
//!   passed by reference. [`Session::register_hub`] probes and admits a
//!   hub; [`Session::update_device_list`] enumerates white/yellow pages
//!   into device records under a soft TTL.
//!
//! - **[`DeviceEntry`](device::DeviceEntry)** — one record per
//!   (hub, serial) pair: identity, ordered function table, cached API
//!   snapshot, log pulling. [`refresh`](device::DeviceEntry::refresh)
//!   diffs logical names and rebuilds the resolution index *before*
//!   returning when one changed.
//!
//! - **[`ResolutionIndex`](directory::ResolutionIndex)** — concurrent
//!   name-to-function tables (`serial.function`, logical names), rebuilt
//!   eagerly on identity changes.
//!
//! - **Domain model** ([`model`]) — `DeviceIdentity`, `FunctionRecord`,
//!   [`FunctionKey`](model::FunctionKey): the stable identity the
//!   per-class function layer caches its wrappers on.

pub mod config;
pub mod device;
pub mod directory;
pub mod error;
pub mod model;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{HubCredentials, SessionConfig};
pub use device::{DeviceEntry, RefreshOutcome};
pub use directory::ResolutionIndex;
pub use error::CoreError;
pub use session::Session;

// Re-export model types at the crate root for ergonomics.
pub use model::{BaseType, DeviceIdentity, FunctionKey, FunctionRecord, HardwareId};
