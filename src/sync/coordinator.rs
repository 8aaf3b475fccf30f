//! Delta propagation and reconnect resync

use crate::devices::{Registry, RegistryDelta, SyncDigest};
use crate::peer::{LinkState, PeerChannel, PeerId, PeerMessage};

/// Keeps registries on connected peers converged
///
/// Holds no registry state of its own; the node passes the registry in for
/// each event so all mutation stays on the node's loop.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    channel: PeerChannel,
}

impl SyncCoordinator {
    #[must_use]
    pub const fn new(channel: PeerChannel) -> Self {
        Self { channel }
    }

    /// Push a local change to every reachable peer
    ///
    /// Best effort: a peer that misses it catches up on reconnect.
    pub fn on_local_change(&self, delta: &RegistryDelta) -> Vec<PeerId> {
        if delta.is_empty() {
            return Vec::new();
        }
        let reached = self
            .channel
            .broadcast(&PeerMessage::Delta(delta.clone()), None);
        tracing::debug!(changes = delta.len(), peers = reached.len(), "local delta broadcast");
        reached
    }

    /// React to a link transition; a newly reachable peer gets our digest
    pub fn on_state_changed(
        &self,
        peer: &PeerId,
        previous: LinkState,
        current: LinkState,
        registry: &Registry,
    ) {
        if current != LinkState::Reachable || previous == LinkState::Reachable {
            return;
        }
        self.request_from(peer, registry.digest());
    }

    /// Answer a peer's digest with every change it has not seen, oldest first
    pub fn on_resync_request(&self, peer: &PeerId, digest: &SyncDigest, registry: &Registry) {
        let missing = registry.changes_since(digest);
        tracing::debug!(peer = %peer, changes = missing.len(), "answering resync request");
        if let Err(e) = self.channel.send(peer, PeerMessage::ResyncReply(missing)) {
            tracing::debug!(peer = %peer, error = %e, "resync reply not delivered");
        }
    }

    /// Merge a delta or resync reply from `from`
    ///
    /// Whatever actually changed is relayed to the other reachable peers so
    /// peers that are not directly linked still converge. Returns the
    /// effective delta.
    pub fn on_remote_delta(
        &self,
        from: &PeerId,
        delta: &RegistryDelta,
        registry: &mut Registry,
    ) -> RegistryDelta {
        let effective = registry.apply(delta);
        if effective.is_empty() {
            return effective;
        }

        let relayed = self
            .channel
            .broadcast(&PeerMessage::Delta(effective.clone()), Some(from));
        tracing::debug!(
            peer = %from,
            received = delta.len(),
            applied = effective.len(),
            relayed = relayed.len(),
            "merged remote delta"
        );
        effective
    }

    /// Ask every reachable peer for what we are missing
    pub fn request_device_list(&self, registry: &Registry) -> Vec<PeerId> {
        let digest = registry.digest();
        let peers = self.channel.reachable_peers();
        for peer in &peers {
            self.request_from(peer, digest.clone());
        }
        peers
    }

    fn request_from(&self, peer: &PeerId, digest: SyncDigest) {
        match self.channel.send(peer, PeerMessage::ResyncRequest(digest)) {
            Ok(()) => tracing::debug!(peer = %peer, "resync requested"),
            Err(e) => tracing::debug!(peer = %peer, error = %e, "resync request not delivered"),
        }
    }
}
