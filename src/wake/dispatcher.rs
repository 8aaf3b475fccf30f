//! Wake dispatch: local capability or forward to the capable peer

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::responder::WakeResponder;
use super::types::{RequestId, WakeOutcome, WakeRequest, WakeResult};
use crate::devices::{DeviceId, WakeAddress};
use crate::peer::{PeerChannel, PeerMessage};
use crate::{Error, Result};

/// Default window for a correlated result from the capable peer
pub const DEFAULT_WAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Callers awaiting a forwarded request, keyed by a per-call token
///
/// A retry while the original is still waiting adds a second waiter; one
/// correlated result answers both.
type Pending = HashMap<RequestId, Vec<(u64, oneshot::Sender<WakeResult>)>>;

/// Issues wake requests and correlates their results
///
/// Never retries on its own; `retry` re-sends an earlier request with the
/// same ID so the waking side can suppress a second physical wake.
#[derive(Clone)]
pub struct WakeDispatcher {
    responder: Option<WakeResponder>,
    channel: PeerChannel,
    pending: Arc<Mutex<Pending>>,
    next_waiter: Arc<AtomicU64>,
    timeout: Duration,
}

impl std::fmt::Debug for WakeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeDispatcher")
            .field("local", &self.is_local())
            .field("pending", &self.pending_count())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WakeDispatcher {
    /// Dispatcher for the process that owns the wake capability
    ///
    /// Local wakes run through `responder`, so they share its request
    /// dedup with wakes forwarded by peers.
    #[must_use]
    pub fn local(responder: WakeResponder, channel: PeerChannel, timeout: Duration) -> Self {
        Self::build(Some(responder), channel, timeout)
    }

    /// Dispatcher that forwards every request to a capable peer
    #[must_use]
    pub fn remote(channel: PeerChannel, timeout: Duration) -> Self {
        Self::build(None, channel, timeout)
    }

    fn build(responder: Option<WakeResponder>, channel: PeerChannel, timeout: Duration) -> Self {
        Self {
            responder,
            channel,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_waiter: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Whether wakes are sent from this process
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.responder.is_some()
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests awaiting a result
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Callers awaiting a result, retries included
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.pending().values().map(Vec::len).sum()
    }

    /// Wake a device with a fresh request
    ///
    /// `address` is required when waking locally and ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when waking locally without an address, and
    /// `Cancelled` if the dispatcher is torn down while waiting
    pub async fn dispatch(
        &self,
        device_id: DeviceId,
        address: Option<WakeAddress>,
    ) -> Result<WakeResult> {
        self.dispatch_request(WakeRequest::new(device_id), address).await
    }

    /// Re-send an earlier request under the same request ID
    ///
    /// # Errors
    ///
    /// Same as [`Self::dispatch`]
    pub async fn retry(
        &self,
        request: &WakeRequest,
        address: Option<WakeAddress>,
    ) -> Result<WakeResult> {
        tracing::info!(
            device_id = %request.device_id,
            request_id = %request.request_id,
            "retrying wake"
        );
        self.dispatch_request(request.clone(), address).await
    }

    /// Dispatch a request built by the caller
    ///
    /// # Errors
    ///
    /// Same as [`Self::dispatch`]
    pub async fn dispatch_request(
        &self,
        request: WakeRequest,
        address: Option<WakeAddress>,
    ) -> Result<WakeResult> {
        if let Some(responder) = &self.responder {
            let address = address.ok_or_else(|| Error::NotFound(request.device_id.to_string()))?;
            return responder.wake_local(&request, address).await;
        }

        let Some(owner) = self.channel.wake_capable_peer() else {
            tracing::info!(device_id = %request.device_id, "no wake-capable peer reachable");
            return Ok(WakeResult::new(request.request_id, WakeOutcome::UnreachablePeer));
        };

        let request_id = request.request_id.clone();
        let device_id = request.device_id.clone();
        let token = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending()
            .entry(request_id.clone())
            .or_default()
            .push((token, tx));

        if let Err(e) = self.channel.send(&owner, PeerMessage::WakeRequest(request)) {
            self.forget(&request_id, token);
            tracing::info!(device_id = %device_id, peer = %owner, error = %e, "wake request not delivered");
            return Ok(WakeResult::new(request_id, WakeOutcome::UnreachablePeer));
        }
        tracing::debug!(device_id = %device_id, request_id = %request_id, peer = %owner, "wake request forwarded");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => {
                tracing::info!(device_id = %device_id, outcome = %result.outcome, "remote wake finished");
                Ok(result)
            }
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.forget(&request_id, token);
                tracing::info!(
                    device_id = %device_id,
                    request_id = %request_id,
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "wake result not received in time"
                );
                Ok(WakeResult::new(request_id, WakeOutcome::TimedOut))
            }
        }
    }

    /// Drop one caller's waiter, leaving any other caller of the same request
    fn forget(&self, request_id: &RequestId, token: u64) {
        let mut pending = self.pending();
        if let Some(waiters) = pending.get_mut(request_id) {
            waiters.retain(|(t, _)| *t != token);
            if waiters.is_empty() {
                pending.remove(request_id);
            }
        }
    }

    /// Deliver a result from the capable peer to every caller awaiting it
    ///
    /// Returns true if a dispatch was waiting for it; late results for
    /// requests that already timed out are dropped.
    pub fn resolve(&self, result: WakeResult) -> bool {
        let Some(waiters) = self.pending().remove(&result.request_id) else {
            tracing::debug!(request_id = %result.request_id, "dropping uncorrelated wake result");
            return false;
        };
        let mut delivered = false;
        for (_, tx) in waiters {
            delivered |= tx.send(result.clone()).is_ok();
        }
        delivered
    }

    /// Abandon every pending dispatch; waiters get `Cancelled`
    pub fn cancel_all(&self) {
        let dropped = std::mem::take(&mut *self.pending());
        let count: usize = dropped.values().map(Vec::len).sum();
        if count > 0 {
            tracing::info!(count, "cancelled pending wake dispatches");
        }
    }
}
