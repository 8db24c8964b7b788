// ── Domain model ──

pub mod function;
pub mod identity;

pub use function::{BaseType, FunctionKey, FunctionRecord, HardwareId};
pub use identity::DeviceIdentity;
