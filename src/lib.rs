//! anywake - Device registry sync and wake dispatch across front ends
//!
//! This library provides the core shared by the phone, watch and widget
//! processes of the anywake app:
//! - A device registry merged last-writer-wins per field
//! - Registry sync over peer links (push deltas, resync on reconnect)
//! - Wake dispatch, local or forwarded to the wake-capable peer
//! - A pinned-device snapshot for widgets and complications
//! - Periodic reachability checks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Front ends                        │
//! │   CLI  │  Watch complication  │  Widget  │  ...      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ NodeHandle
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Node                            │
//! │  Registry │ Sync │ Wake Dispatcher │ Snapshot │ Status │
//! └────────────────────┬────────────────────────────────┘
//!                      │ PeerChannel (JSON lines)
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Other nodes                          │
//! │   phone (wake-capable)  │  watch  │  widget host     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod node;
pub mod peer;
pub mod snapshot;
pub mod status;
pub mod sync;
pub mod wake;

pub use config::Config;
pub use devices::{Device, DeviceId, DeviceStatus, FieldValue, Registry, RegistryDelta, WakeAddress};
pub use error::{Error, Result};
pub use node::{Node, NodeHandle, NodeOptions, PeerInfo};
pub use peer::{PeerChannel, PeerId};
pub use snapshot::{SnapshotEntry, SnapshotProvider, snapshot};
pub use sync::SyncCoordinator;
pub use wake::{WakeDispatcher, WakeOutcome, WakeRequest, WakeResult};
