//! Wake command dispatch
//!
//! A wake is either sent from this process, when it owns the wake
//! capability, or forwarded to the peer that does and correlated by
//! request ID with a bounded wait

pub mod capability;
pub mod dedup;
pub mod dispatcher;
pub mod responder;
pub mod types;

pub use capability::{CommandWake, DEFAULT_WAKE_ARGS, WakeCapability};
pub use dedup::{RequestDedup, Seen};
pub use dispatcher::{DEFAULT_WAKE_TIMEOUT, WakeDispatcher};
pub use responder::WakeResponder;
pub use types::{RequestId, WakeOutcome, WakeRequest, WakeResult};
