//! Registry sync integration tests
//!
//! Merge convergence on a bare registry, resync over linked channels, and
//! full nodes keeping each other up to date

use anywake::devices::{DeviceField, FieldChange, Stamp};
use anywake::peer::{ChannelEvent, ChannelEvents, Hello, LinkState, PeerMessage};
use anywake::{
    DeviceId, FieldValue, NodeOptions, PeerChannel, PeerId, Registry, RegistryDelta,
    SyncCoordinator, WakeAddress,
};

mod common;
use common::{address, eventually_async, link, spawn_node};

fn change(device: &str, value: FieldValue, millis: i64, peer: &str) -> RegistryDelta {
    RegistryDelta::new(vec![FieldChange {
        device_id: DeviceId::from(device),
        value,
        stamp: Stamp::new(millis, peer),
    }])
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for rest in permutations(n - 1) {
        for pos in 0..=rest.len() {
            let mut p = rest.clone();
            p.insert(pos, n - 1);
            out.push(p);
        }
    }
    out
}

#[test]
fn any_delivery_order_converges() {
    let moved = WakeAddress::new("11:22:33:44:55:66", "10.0.0.255", 7).unwrap();
    let deltas = vec![
        change("d1", FieldValue::Name("Desktop".to_string()), 1, "phone"),
        change("d1", FieldValue::Name("Workstation".to_string()), 3, "watch"),
        change("d1", FieldValue::Pinned(true), 2, "watch"),
        change("d1", FieldValue::Address(address()), 2, "phone"),
        change("d1", FieldValue::Address(moved.clone()), 2, "watch"),
        change("d2", FieldValue::Name("NAS".to_string()), 1, "watch"),
        change("d2", FieldValue::Removed, 4, "phone"),
        change("d2", FieldValue::Name("Old NAS".to_string()), 5, "watch"),
    ];

    let mut reference = None;
    // Every ordering of the first six, with the last two appended in both orders
    for order in permutations(6) {
        for tail in [[6, 7], [7, 6]] {
            let mut registry = Registry::ephemeral(PeerId::new("widget"));
            for idx in order.iter().chain(tail.iter()) {
                registry.apply(&deltas[*idx]);
            }
            // Duplicate delivery changes nothing
            for delta in &deltas {
                assert!(registry.apply(delta).is_empty());
            }

            let device = registry.get(&DeviceId::from("d1")).unwrap();
            assert_eq!(device.name, "Workstation");
            assert_eq!(device.address, moved);
            assert!(device.is_pinned);
            assert!(registry.is_removed(&DeviceId::from("d2")));

            let state = (device.clone(), registry.digest());
            let first = reference.get_or_insert_with(|| state.clone());
            assert_eq!(*first, state);
        }
    }
}

async fn next_message(events: &mut ChannelEvents) -> PeerMessage {
    loop {
        if let Some(ChannelEvent::Message { message, .. }) = events.recv().await {
            return message;
        }
    }
}

async fn wait_reachable(events: &mut ChannelEvents) {
    loop {
        if let Some(ChannelEvent::StateChanged {
            current: LinkState::Reachable,
            ..
        }) = events.recv().await
        {
            return;
        }
    }
}

#[tokio::test]
async fn reconnect_resync_replays_missed_changes_in_order() {
    let mut phone_registry = Registry::ephemeral(PeerId::new("phone"));
    let (id, first) = phone_registry.add("Desktop", address()).unwrap();
    phone_registry
        .mutate(&id, FieldValue::Name("Gaming PC".to_string()))
        .unwrap();
    phone_registry.mutate(&id, FieldValue::Pinned(true)).unwrap();

    // The watch only saw the add
    let mut watch_registry = Registry::ephemeral(PeerId::new("watch"));
    watch_registry.apply(&first);

    let (phone, mut phone_events) = PeerChannel::new(Hello::new(PeerId::new("phone"), true));
    let (watch, mut watch_events) = PeerChannel::new(Hello::new(PeerId::new("watch"), false));
    link(&phone, &watch).await;
    wait_reachable(&mut phone_events).await;
    wait_reachable(&mut watch_events).await;

    let watch_sync = SyncCoordinator::new(watch);
    watch_sync.on_state_changed(
        &PeerId::new("phone"),
        LinkState::Connecting,
        LinkState::Reachable,
        &watch_registry,
    );

    let PeerMessage::ResyncRequest(digest) = next_message(&mut phone_events).await else {
        panic!("expected resync request");
    };
    SyncCoordinator::new(phone).on_resync_request(&PeerId::new("watch"), &digest, &phone_registry);

    let PeerMessage::ResyncReply(reply) = next_message(&mut watch_events).await else {
        panic!("expected resync reply");
    };
    let replayed: Vec<(i64, DeviceField)> = reply
        .iter()
        .map(|c| (c.stamp.millis, c.value.field()))
        .collect();
    assert_eq!(replayed, vec![(2, DeviceField::Name), (3, DeviceField::Pinned)]);

    let effective = watch_sync.on_remote_delta(&PeerId::new("phone"), &reply, &mut watch_registry);
    assert_eq!(effective.len(), 2);
    assert_eq!(watch_registry.get(&id), phone_registry.get(&id));
}

#[tokio::test]
async fn added_device_reaches_linked_node() {
    let (phone, phone_handle) = spawn_node("phone", NodeOptions::default());
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    link(&phone, &watch).await;

    let id = phone_handle.add("Desktop", address()).await.unwrap();
    phone_handle.mutate(&id, FieldValue::Pinned(true)).await.unwrap();

    eventually_async("pinned device on watch", || async {
        watch_handle
            .request_snapshot()
            .await
            .unwrap()
            .iter()
            .any(|e| e.id == id && e.name == "Desktop")
    })
    .await;
}

#[tokio::test]
async fn offline_edits_to_different_fields_both_survive() {
    let (phone, phone_handle) = spawn_node("phone", NodeOptions::default());
    let (watch, watch_handle) = spawn_node("watch", NodeOptions::default());
    link(&phone, &watch).await;

    let id = phone_handle.add("Desktop", address()).await.unwrap();
    eventually_async("device on watch", || async {
        watch_handle.list().await.unwrap().len() == 1
    })
    .await;

    phone.disconnect(watch.local_id());
    eventually_async("link down", || async {
        phone.state(watch.local_id()) == LinkState::Disconnected
            && watch.state(phone.local_id()) == LinkState::Disconnected
    })
    .await;

    let moved = WakeAddress::new("11:22:33:44:55:66", "10.0.0.255", 7).unwrap();
    phone_handle
        .mutate(&id, FieldValue::Name("Gaming PC".to_string()))
        .await
        .unwrap();
    watch_handle
        .mutate(&id, FieldValue::Address(moved.clone()))
        .await
        .unwrap();

    link(&phone, &watch).await;

    for handle in [&phone_handle, &watch_handle] {
        eventually_async("merged device", || async {
            let devices = handle.list().await.unwrap();
            devices.len() == 1 && devices[0].name == "Gaming PC" && devices[0].address == moved
        })
        .await;
    }
}

#[tokio::test]
async fn removal_propagates_through_relay() {
    // phone <-> watch <-> widget; phone and widget are not linked directly
    let (phone, phone_handle) = spawn_node("phone", NodeOptions::default());
    let (watch, _watch_handle) = spawn_node("watch", NodeOptions::default());
    let (widget, widget_handle) = spawn_node("widget", NodeOptions::default());
    link(&phone, &watch).await;
    link(&watch, &widget).await;

    let id = phone_handle.add("NAS", address()).await.unwrap();
    eventually_async("device relayed to widget", || async {
        widget_handle.list().await.unwrap().iter().any(|d| d.id == id)
    })
    .await;

    phone_handle.remove(&id).await.unwrap();
    eventually_async("removal relayed to widget", || async {
        widget_handle.list().await.unwrap().is_empty()
    })
    .await;

    let err = widget_handle
        .mutate(&id, FieldValue::Name("Back".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, anywake::Error::NotFound(_)));
}
