//! Pinned device snapshot for constrained front ends
//!
//! Watch complications and widgets show at most three devices. The snapshot
//! is computed from the registry on demand and pushed over a `watch` channel
//! after every mutation and on the periodic trigger.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::devices::{Device, DeviceId, Registry};

/// Most devices a snapshot will ever hold
pub const SNAPSHOT_LIMIT: usize = 3;

/// Pinned devices ordered by when they were pinned, oldest first
///
/// Ties on pin time fall back to insertion order. Never more than
/// [`SNAPSHOT_LIMIT`] entries, empty when nothing is pinned.
#[must_use]
pub fn snapshot(registry: &Registry) -> Vec<Device> {
    let mut pinned: Vec<_> = registry
        .records()
        .filter(|r| r.device.is_pinned)
        .map(|r| (r.clocks.pinned.millis, r.seq, &r.device))
        .collect();
    pinned.sort_by_key(|(millis, seq, _)| (*millis, *seq));
    pinned
        .into_iter()
        .take(SNAPSHOT_LIMIT)
        .map(|(_, _, device)| device.clone())
        .collect()
}

/// What a front end renders for one pinned device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: DeviceId,
    pub name: String,
    pub is_pinned: bool,
}

impl From<&Device> for SnapshotEntry {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            is_pinned: device.is_pinned,
        }
    }
}

/// Publishes snapshots to subscribers
#[derive(Debug)]
pub struct SnapshotProvider {
    tx: watch::Sender<Vec<SnapshotEntry>>,
}

impl Default for SnapshotProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotProvider {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Recompute from the registry; subscribers are only woken on change
    pub fn publish(&self, registry: &Registry) -> Vec<SnapshotEntry> {
        let entries: Vec<SnapshotEntry> = snapshot(registry).iter().map(SnapshotEntry::from).collect();
        let changed = self.tx.send_if_modified(|current| {
            if *current == entries {
                return false;
            }
            current.clone_from(&entries);
            true
        });
        if changed {
            tracing::debug!(entries = entries.len(), "snapshot published");
        }
        entries
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<SnapshotEntry>> {
        self.tx.subscribe()
    }

    /// Last published snapshot
    #[must_use]
    pub fn current(&self) -> Vec<SnapshotEntry> {
        self.tx.borrow().clone()
    }
}
