//! Registry sync between peers
//!
//! Every process keeps its own registry as the authoritative local copy.
//! Local changes are pushed to reachable peers as deltas; a peer that
//! (re)connects is asked for everything newer than our digest. Merging is
//! per-field last-writer-wins inside the registry.

pub mod coordinator;

pub use coordinator::SyncCoordinator;
