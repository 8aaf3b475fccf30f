//! Receiving side of wake requests

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::capability::WakeCapability;
use super::dedup::{RequestDedup, Seen};
use super::types::{RequestId, WakeOutcome, WakeRequest, WakeResult};
use crate::devices::WakeAddress;
use crate::{Error, Result};

#[derive(Debug)]
struct State {
    dedup: RequestDedup,
    /// Local callers waiting on a request another caller is running
    waiters: HashMap<RequestId, Vec<oneshot::Sender<WakeOutcome>>>,
}

/// Runs wake requests on the capable process, at most once per request ID
///
/// Both forwarded requests and local dispatches go through the same cache:
/// a retry of a completed request is answered without a second physical
/// wake for the retention window.
#[derive(Clone)]
pub struct WakeResponder {
    capability: Arc<dyn WakeCapability>,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for WakeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeResponder").finish_non_exhaustive()
    }
}

impl WakeResponder {
    #[must_use]
    pub fn new(capability: Arc<dyn WakeCapability>, retention: Duration) -> Self {
        Self {
            capability,
            state: Arc::new(Mutex::new(State {
                dedup: RequestDedup::new(retention),
                waiters: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a forwarded request
    ///
    /// `address` is `None` when this registry does not know the device.
    /// Returns `None` when the request is a duplicate of one in flight; its
    /// result goes out when the first copy completes.
    pub async fn respond(
        &self,
        request: &WakeRequest,
        address: Option<WakeAddress>,
    ) -> Option<WakeResult> {
        let seen = self.state().dedup.check(&request.request_id);
        match seen {
            Seen::Completed(outcome) => {
                tracing::debug!(
                    request_id = %request.request_id,
                    %outcome,
                    "duplicate wake request answered from cache"
                );
                Some(WakeResult::new(request.request_id.clone(), outcome))
            }
            Seen::InFlight => {
                tracing::debug!(request_id = %request.request_id, "duplicate wake request still in flight");
                None
            }
            Seen::New => Some(self.run(request, address).await),
        }
    }

    /// Handle a request issued on this process
    ///
    /// Unlike [`Self::respond`], a duplicate of a request still in flight
    /// waits for that request's outcome instead of returning nothing.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the in-flight copy was abandoned before it
    /// finished
    pub async fn wake_local(
        &self,
        request: &WakeRequest,
        address: WakeAddress,
    ) -> Result<WakeResult> {
        let waiter = {
            let mut state = self.state();
            match state.dedup.check(&request.request_id) {
                Seen::Completed(outcome) => {
                    tracing::debug!(
                        request_id = %request.request_id,
                        %outcome,
                        "repeated local wake answered from cache"
                    );
                    return Ok(WakeResult::new(request.request_id.clone(), outcome));
                }
                Seen::InFlight => {
                    let (tx, rx) = oneshot::channel();
                    state
                        .waiters
                        .entry(request.request_id.clone())
                        .or_default()
                        .push(tx);
                    Some(rx)
                }
                Seen::New => None,
            }
        };

        match waiter {
            Some(rx) => {
                let outcome = rx.await.map_err(|_| Error::Cancelled)?;
                Ok(WakeResult::new(request.request_id.clone(), outcome))
            }
            None => Ok(self.run(request, Some(address)).await),
        }
    }

    /// Wake once for a request the cache reported as new
    async fn run(&self, request: &WakeRequest, address: Option<WakeAddress>) -> WakeResult {
        let outcome = match address {
            None => {
                tracing::warn!(device_id = %request.device_id, "wake requested for unknown device");
                WakeOutcome::CapabilityFailed
            }
            Some(address) => match self.capability.attempt_wake(&address).await {
                Ok(()) => WakeOutcome::Sent,
                Err(e) => {
                    tracing::warn!(device_id = %request.device_id, error = %e, "wake attempt failed");
                    WakeOutcome::CapabilityFailed
                }
            },
        };

        let waiters = {
            let mut state = self.state();
            state.dedup.complete(&request.request_id, outcome);
            state.waiters.remove(&request.request_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(outcome);
        }

        tracing::info!(
            device_id = %request.device_id,
            request_id = %request.request_id,
            %outcome,
            "wake handled"
        );
        WakeResult::new(request.request_id.clone(), outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::devices::DeviceId;

    #[derive(Default)]
    struct CountingWake {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WakeCapability for CountingWake {
        async fn attempt_wake(&self, _address: &WakeAddress) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn address() -> WakeAddress {
        WakeAddress::new("aa:bb:cc:dd:ee:ff", "192.168.1.255", 9).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_request_wakes_once() {
        let wake = Arc::new(CountingWake::default());
        let responder = WakeResponder::new(wake.clone(), Duration::from_secs(60));
        let request = WakeRequest::new(DeviceId::from("d1"));

        let first = responder.respond(&request, Some(address())).await.unwrap();
        let second = responder.respond(&request, Some(address())).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.outcome, WakeOutcome::Sent);
        assert_eq!(wake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_after_retention_wakes_again() {
        let wake = Arc::new(CountingWake::default());
        let responder = WakeResponder::new(wake.clone(), Duration::from_secs(60));
        let request = WakeRequest::new(DeviceId::from("d1"));

        responder.respond(&request, Some(address())).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        responder.respond(&request, Some(address())).await.unwrap();

        assert_eq!(wake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_device_is_capability_failed() {
        let wake = Arc::new(CountingWake::default());
        let responder = WakeResponder::new(wake.clone(), Duration::from_secs(60));
        let request = WakeRequest::new(DeviceId::from("ghost"));

        let result = responder.respond(&request, None).await.unwrap();
        assert_eq!(result.outcome, WakeOutcome::CapabilityFailed);
        assert_eq!(wake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_and_forwarded_copies_share_the_cache() {
        let wake = Arc::new(CountingWake::default());
        let responder = WakeResponder::new(wake.clone(), Duration::from_secs(60));
        let request = WakeRequest::new(DeviceId::from("d1"));

        let local = responder.wake_local(&request, address()).await.unwrap();
        let forwarded = responder.respond(&request, Some(address())).await.unwrap();
        let again = responder.wake_local(&request, address()).await.unwrap();

        assert_eq!(local, forwarded);
        assert_eq!(local, again);
        assert_eq!(wake.calls.load(Ordering::SeqCst), 1);
    }

    struct GatedWake {
        calls: AtomicUsize,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl WakeCapability for GatedWake {
        async fn attempt_wake(&self, _address: &WakeAddress) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_duplicate_waits_for_the_running_wake() {
        let wake = Arc::new(GatedWake {
            calls: AtomicUsize::new(0),
            gate: tokio::sync::Notify::new(),
        });
        let responder = WakeResponder::new(wake.clone(), Duration::from_secs(60));
        let request = WakeRequest::new(DeviceId::from("d1"));

        let first = tokio::spawn({
            let responder = responder.clone();
            let request = request.clone();
            async move { responder.wake_local(&request, address()).await }
        });
        while wake.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let responder = responder.clone();
            let request = request.clone();
            async move { responder.wake_local(&request, address()).await }
        });
        while responder.state().waiters.is_empty() {
            tokio::task::yield_now().await;
        }
        wake.gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.outcome, WakeOutcome::Sent);
        assert_eq!(second, first);
        assert_eq!(wake.calls.load(Ordering::SeqCst), 1);
    }
}
