//! Device registry
//!
//! The canonical list of wakeable devices owned by one process. Every write
//! is a timestamped field change; peers exchange those changes as deltas and
//! merge them last-writer-wins per field

pub mod clock;
pub mod registry;
pub mod store;
pub mod types;

pub use clock::{Clock, Stamp};
pub use registry::Registry;
pub use store::{DeviceRecord, DeviceStore, FieldClocks, JsonFileStore, MemoryStore, StoredRegistry};
pub use types::{
    DEFAULT_WAKE_PORT, Device, DeviceField, DeviceId, DeviceStatus, FieldChange, FieldValue,
    MAX_STAMP_SKEW_MILLIS, RegistryDelta, SyncDigest, WakeAddress, normalize_mac,
};
