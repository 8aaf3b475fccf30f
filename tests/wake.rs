//! Wake dispatch integration tests
//!
//! A watch node without wake capability forwards requests to a phone node
//! that has it

use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use anywake::peer::{ChannelEvent, ChannelEvents, Hello, PeerMessage};
use anywake::{
    DeviceId, Error, NodeOptions, PeerChannel, PeerId, WakeOutcome, WakeRequest, WakeResult,
};

mod common;
use common::{address, eventually_async, link, spawn_capable_node, spawn_node};

async fn next_wake_request(events: &mut ChannelEvents) -> WakeRequest {
    loop {
        if let Some(ChannelEvent::Message {
            message: PeerMessage::WakeRequest(request),
            ..
        }) = events.recv().await
        {
            return request;
        }
    }
}

#[tokio::test]
async fn forwarded_wake_is_sent_by_capable_peer() {
    let (phone, phone_handle, wake) = spawn_capable_node("phone");
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    link(&phone, &watch).await;

    let id = phone_handle.add("Desktop", address()).await.unwrap();
    eventually_async("device on watch", || async {
        watch_handle.list().await.unwrap().iter().any(|d| d.id == id)
    })
    .await;

    let result = watch_handle.request_wake(&id).await.unwrap();
    assert_eq!(result.outcome, WakeOutcome::Sent);
    assert_eq!(wake.calls(), 1);
}

#[tokio::test]
async fn local_wake_on_capable_node() {
    let (_phone, phone_handle, wake) = spawn_capable_node("phone");
    let id = phone_handle.add("Desktop", address()).await.unwrap();

    let result = assert_ok!(phone_handle.request_wake(&id).await);
    assert_eq!(result.outcome, WakeOutcome::Sent);
    assert_eq!(wake.calls(), 1);

    let err = assert_err!(phone_handle.request_wake(&DeviceId::from("ghost")).await);
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn no_capable_peer_is_unreachable() {
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    let (widget, _widget_handle) = spawn_node("widget", NodeOptions::default());
    link(&watch, &widget).await;

    let result = watch_handle
        .request_wake(&DeviceId::from("d1"))
        .await
        .unwrap();
    assert_eq!(result.outcome, WakeOutcome::UnreachablePeer);
}

#[tokio::test]
async fn silent_peer_times_out() {
    // Claims the capability but never answers
    let (silent, _silent_events) = PeerChannel::new(Hello::new(PeerId::new("phone"), true));
    let (watch, watch_handle) = spawn_node(
        "watch",
        NodeOptions {
            wake_timeout: Duration::from_millis(200),
            ..NodeOptions::default()
        },
    );
    link(&silent, &watch).await;

    let result = watch_handle
        .request_wake(&DeviceId::from("d1"))
        .await
        .unwrap();
    assert_eq!(result.outcome, WakeOutcome::TimedOut);
}

#[tokio::test]
async fn retry_reuses_request_id_and_wakes_once() {
    let (phone, phone_handle, wake) = spawn_capable_node("phone");
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    link(&phone, &watch).await;

    let id = phone_handle.add("NAS", address()).await.unwrap();
    let request = WakeRequest::new(id.clone());

    let first = watch_handle.wake(request.clone()).await.unwrap();
    let second = watch_handle.retry_wake(&request).await.unwrap();

    assert_eq!(first.outcome, WakeOutcome::Sent);
    assert_eq!(second, first);
    assert_eq!(second.request_id, request.request_id);
    assert_eq!(wake.calls(), 1);
}

#[tokio::test]
async fn unknown_device_at_owner_is_capability_failed() {
    let (phone, _phone_handle, wake) = spawn_capable_node("phone");
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    link(&phone, &watch).await;

    let result = watch_handle
        .request_wake(&DeviceId::from("never-added"))
        .await
        .unwrap();
    assert_eq!(result.outcome, WakeOutcome::CapabilityFailed);
    assert_eq!(wake.calls(), 0);
}

#[tokio::test]
async fn shutdown_cancels_pending_wake() {
    let (silent, mut silent_events) = PeerChannel::new(Hello::new(PeerId::new("phone"), true));
    let (watch, watch_handle) = spawn_node(
        "watch",
        NodeOptions {
            wake_timeout: Duration::from_secs(60),
            ..NodeOptions::default()
        },
    );
    link(&silent, &watch).await;

    let pending = tokio::spawn({
        let handle = watch_handle.clone();
        async move { handle.request_wake(&DeviceId::from("d1")).await }
    });
    next_wake_request(&mut silent_events).await;

    watch_handle.shutdown().await;
    let err = assert_err!(pending.await.unwrap());
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn local_retry_wakes_once() {
    let (_phone, phone_handle, wake) = spawn_capable_node("phone");
    let id = phone_handle.add("Desktop", address()).await.unwrap();
    let request = WakeRequest::new(id);

    let first = assert_ok!(phone_handle.wake(request.clone()).await);
    let second = assert_ok!(phone_handle.retry_wake(&request).await);

    assert_eq!(first.outcome, WakeOutcome::Sent);
    assert_eq!(second, first);
    assert_eq!(wake.calls(), 1);
}

#[tokio::test]
async fn retry_during_pending_wake_keeps_both_callers() {
    let (silent, mut silent_events) = PeerChannel::new(Hello::new(PeerId::new("phone"), true));
    let (watch, watch_handle) = spawn_node(
        "watch",
        NodeOptions {
            wake_timeout: Duration::from_millis(500),
            ..NodeOptions::default()
        },
    );
    link(&silent, &watch).await;
    let request = WakeRequest::new(DeviceId::from("d1"));

    let original = tokio::spawn({
        let handle = watch_handle.clone();
        let request = request.clone();
        async move { handle.wake(request).await }
    });
    next_wake_request(&mut silent_events).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let retry = tokio::spawn({
        let handle = watch_handle.clone();
        let request = request.clone();
        async move { handle.retry_wake(&request).await }
    });
    next_wake_request(&mut silent_events).await;

    let first = assert_ok!(original.await.unwrap());
    let second = assert_ok!(retry.await.unwrap());
    assert_eq!(first.outcome, WakeOutcome::TimedOut);
    assert_eq!(second.outcome, WakeOutcome::TimedOut);
}

#[tokio::test]
async fn owner_answer_reaches_original_and_retry() {
    let (silent, mut silent_events) = PeerChannel::new(Hello::new(PeerId::new("phone"), true));
    let (watch, watch_handle) = spawn_node(
        "watch",
        NodeOptions {
            wake_timeout: Duration::from_secs(30),
            ..NodeOptions::default()
        },
    );
    link(&silent, &watch).await;
    let request = WakeRequest::new(DeviceId::from("d1"));

    let original = tokio::spawn({
        let handle = watch_handle.clone();
        let request = request.clone();
        async move { handle.wake(request).await }
    });
    next_wake_request(&mut silent_events).await;
    let retry = tokio::spawn({
        let handle = watch_handle.clone();
        let request = request.clone();
        async move { handle.retry_wake(&request).await }
    });
    next_wake_request(&mut silent_events).await;

    let answer = WakeResult::new(request.request_id.clone(), WakeOutcome::Sent);
    silent
        .send(watch.local_id(), PeerMessage::WakeResult(answer.clone()))
        .unwrap();

    assert_eq!(assert_ok!(original.await.unwrap()), answer);
    assert_eq!(assert_ok!(retry.await.unwrap()), answer);
}
