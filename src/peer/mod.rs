//! Peer channel between processes of the same application
//!
//! The phone, the watch and the widget host each run a node; nodes exchange
//! registry deltas and wake requests over these links

pub mod backoff;
pub mod channel;
pub mod transport;
pub mod types;

pub use backoff::{BackoffPolicy, Redial};
pub use channel::{ChannelEvents, PeerChannel};
pub use types::{ChannelEvent, Hello, LinkState, PROTOCOL_VERSION, PeerId, PeerMessage};
