//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anywake::devices::{Clock, MemoryStore};
use anywake::peer::{LinkState, PeerChannel, PeerId};
use anywake::wake::WakeCapability;
use anywake::{Node, NodeHandle, NodeOptions, Registry, WakeAddress};
use async_trait::async_trait;

/// A valid wake address for tests
#[must_use]
pub fn address() -> WakeAddress {
    WakeAddress::new("aa:bb:cc:dd:ee:ff", "192.168.1.255", 9).expect("valid address")
}

/// Wake capability that only counts calls
#[derive(Debug, Default)]
pub struct CountingWake {
    calls: AtomicUsize,
}

impl CountingWake {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeCapability for CountingWake {
    async fn attempt_wake(&self, _address: &WakeAddress) -> anywake::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Start a node over a memory store with a logical clock
pub fn spawn_node(peer: &str, options: NodeOptions) -> (PeerChannel, NodeHandle) {
    let registry = Registry::open(Box::new(MemoryStore::new()), Clock::logical(PeerId::new(peer)))
        .expect("memory store opens");
    let (node, handle) = Node::new(registry, options);
    let channel = node.channel();
    tokio::spawn(node.run());
    (channel, handle)
}

/// Start a wake-capable node and return its capability for inspection
pub fn spawn_capable_node(peer: &str) -> (PeerChannel, NodeHandle, Arc<CountingWake>) {
    let wake = Arc::new(CountingWake::default());
    let (channel, handle) = spawn_node(
        peer,
        NodeOptions {
            capability: Some(wake.clone()),
            ..NodeOptions::default()
        },
    );
    (channel, handle, wake)
}

/// Connect two channels over an in-memory stream and wait until both see the link
pub async fn link(a: &PeerChannel, b: &PeerChannel) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (a_id, b_id) = (a.local_id().clone(), b.local_id().clone());
    tokio::spawn({
        let a = a.clone();
        let b_id = b_id.clone();
        async move { a.attach_to(&b_id, left).await }
    });
    tokio::spawn({
        let b = b.clone();
        let a_id = a_id.clone();
        async move { b.attach_to(&a_id, right).await }
    });

    eventually("link reachable", || {
        a.state(&b_id) == LinkState::Reachable && b.state(&a_id) == LinkState::Reachable
    })
    .await;
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async form of [`eventually`] for checks that query a node
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
