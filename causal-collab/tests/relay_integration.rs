//! Integration tests for the relay protocol over in-memory stores.
//!
//! Every delivery is captured by a `MemoryMessenger`, so each test can check
//! exactly which device received what.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use causal_collab::messenger::MemoryMessenger;
use causal_collab::protocol::{
    AddAtoms, AddUpdates, AtomsReceived, ClientMessage, DeviceSelector, GetUpdates, Login,
    RemoteAction, SendEvent, ServerMessage, SyncTimeRequest, UpdatesReceived, WatchBranch,
    MAX_SIZE_REACHED, ON_WEBHOOK, SERVER_DEVICE_ID,
};
use causal_collab::relay::{CausalRepoServer, RelayError, WebhookRequest, WebhookStatus};
use causal_collab::runtime::{FixedRandom, ManualClock};
use causal_collab::storage::{
    AtomStore, ConnectionStore, DeviceConnection, MemoryAtomStore, MemoryConnectionStore,
    MemoryUpdatesStore, StoreError, UpdatesStore,
};
use causal_core::atom::setup_branch_op;
use causal_core::{atomize_bot, encode_update, Atom, AtomId, BotAction, BotTags, BotsDoc};
use serde_json::{json, Value};

struct Harness {
    relay: CausalRepoServer,
    messenger: Arc<MemoryMessenger>,
    atoms: Arc<MemoryAtomStore>,
    updates: Arc<MemoryUpdatesStore>,
    connections: Arc<MemoryConnectionStore>,
    random: Arc<FixedRandom>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with_updates(MemoryUpdatesStore::new())
}

fn harness_with_updates(updates: MemoryUpdatesStore) -> Harness {
    let messenger = Arc::new(MemoryMessenger::new());
    let atoms = Arc::new(MemoryAtomStore::new());
    let updates = Arc::new(updates);
    let connections = Arc::new(MemoryConnectionStore::new());
    let random = Arc::new(FixedRandom::new(0));
    let clock = Arc::new(ManualClock::new(1_000));

    let relay = CausalRepoServer::new(
        atoms.clone(),
        updates.clone(),
        connections.clone(),
        messenger.clone(),
    )
    .with_random(random.clone())
    .with_clock(clock.clone());

    Harness {
        relay,
        messenger,
        atoms,
        updates,
        connections,
        random,
        clock,
    }
}

impl Harness {
    async fn device(&self, id: &str) {
        self.relay
            .connect(DeviceConnection::new(id, format!("session-{id}"), format!("user-{id}")))
            .await
            .unwrap();
    }

    async fn watch(&self, id: &str, watch: WatchBranch) {
        self.relay.watch_branch(id, watch).await.unwrap();
    }

    async fn add(&self, id: &str, branch: &str, atoms: Vec<Atom>) {
        self.relay
            .add_atoms(id, AddAtoms::new(branch, atoms))
            .await
            .unwrap();
    }

    async fn received(&self, id: &str) -> Vec<ServerMessage> {
        self.messenger.messages_for(id).await
    }

    async fn branch_atoms(&self, branch: &str) -> usize {
        self.atoms
            .count_atoms(&format!("/branch/{branch}"))
            .await
            .unwrap()
    }
}

fn tags(pairs: &[(&str, Value)]) -> BotTags {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn bot_atoms(site: &str, bot: &str) -> Vec<Atom> {
    atomize_bot(site, 1, bot, &tags(&[("color", json!("red"))]))
}

fn names(messages: &[ServerMessage]) -> Vec<&'static str> {
    messages.iter().map(ServerMessage::name).collect()
}

// ─── Scenarios ──────────────────────────────────────────────

#[tokio::test]
async fn test_atoms_added_before_watch_arrive_in_snapshot() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;

    let atoms = bot_atoms("s1", "b1");
    h.add("d1", "b", atoms.clone()).await;
    h.watch("d2", WatchBranch::new("b")).await;

    let received = h.received("d2").await;
    assert_eq!(
        received,
        vec![ServerMessage::AddAtoms(AddAtoms {
            branch: Some("b".into()),
            atoms: Some(atoms),
            removed_atoms: None,
            initial: Some(true),
        })]
    );
}

#[tokio::test]
async fn test_temporary_branch_cleared_after_last_unwatch() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d1", WatchBranch::new("t").temporary()).await;
    h.watch("d2", WatchBranch::new("t").temporary()).await;

    h.add("d1", "t", bot_atoms("s1", "b1")).await;
    assert_eq!(h.branch_atoms("t").await, 3);

    h.relay.unwatch_branch("d1", "t").await.unwrap();
    assert_eq!(h.branch_atoms("t").await, 3, "one watcher remains");

    h.relay.unwatch_branch("d2", "t").await.unwrap();
    assert_eq!(h.branch_atoms("t").await, 0);
}

#[tokio::test]
async fn test_temporary_branch_cleared_on_disconnect() {
    let h = harness();
    h.device("d1").await;
    h.watch("d1", WatchBranch::new("t").temporary().updates()).await;
    h.relay
        .add_updates(
            "d1",
            AddUpdates {
                branch: "t".into(),
                updates: vec!["u1".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.relay.disconnect("d1").await.unwrap();

    assert!(h.updates.get_updates("t").await.unwrap().updates.is_empty());
    assert_eq!(h.connections.count_connections().await.unwrap(), 0);
}

#[tokio::test]
async fn test_persistent_branch_survives_unwatch() {
    let h = harness();
    h.device("d1").await;
    h.watch("d1", WatchBranch::new("p")).await;
    h.add("d1", "p", bot_atoms("s1", "b1")).await;

    h.relay.unwatch_branch("d1", "p").await.unwrap();
    h.relay.disconnect("d1").await.unwrap();

    assert_eq!(h.branch_atoms("p").await, 3);
}

#[tokio::test]
async fn test_event_routed_by_session() {
    let h = harness();
    for id in ["d1", "d2", "d3"] {
        h.device(id).await;
    }
    h.watch("d2", WatchBranch::new("b")).await;
    h.watch("d3", WatchBranch::new("b")).await;
    h.messenger.clear().await;

    let action = RemoteAction::remote(json!({"type": "abc"}), DeviceSelector::session("session-d3"));
    h.relay
        .send_event("d1", SendEvent { branch: "b".into(), action })
        .await
        .unwrap();

    assert!(h.received("d2").await.is_empty());
    let received = h.received("d3").await;
    let [ServerMessage::ReceiveEvent(event)] = received.as_slice() else {
        panic!("expected one receive_event, got {received:?}");
    };
    assert_eq!(event.branch, "b");
    assert_eq!(event.action.event, json!({"type": "abc"}));
    assert_eq!(event.action.device.connection_id, "d1");
}

#[tokio::test]
async fn test_webhook_status_codes() {
    let h = harness();
    let request = WebhookRequest {
        method: "POST".into(),
        url: "https://example.com/hook".into(),
        headers: BTreeMap::from([("Content-Type".into(), "application/json".into())]),
        body: Some(r#"{"ok":true}"#.into()),
    };

    assert_eq!(
        h.relay.webhook("w", request.clone()).await.unwrap(),
        WebhookStatus::NotFound
    );

    h.device("d1").await;
    h.add("d1", "w", bot_atoms("s1", "b1")).await;
    assert_eq!(
        h.relay.webhook("w", request.clone()).await.unwrap(),
        WebhookStatus::Unavailable
    );

    h.watch("d1", WatchBranch::new("w")).await;
    h.messenger.clear().await;
    let status = h.relay.webhook("w", request).await.unwrap();
    assert_eq!(status, WebhookStatus::Delivered);
    assert_eq!(status.code(), 200);

    let received = h.received("d1").await;
    let [ServerMessage::ReceiveEvent(event)] = received.as_slice() else {
        panic!("expected one receive_event, got {received:?}");
    };
    assert_eq!(event.action.event["type"], json!(ON_WEBHOOK));
    assert_eq!(event.action.event["method"], json!("POST"));
    assert_eq!(event.action.event["data"], json!({"ok": true}));
    assert_eq!(event.action.device.connection_id, SERVER_DEVICE_ID);
}

#[tokio::test]
async fn test_webhook_malformed_body() {
    let h = harness();
    let request = WebhookRequest {
        method: "POST".into(),
        headers: BTreeMap::from([("content-type".into(), "application/json".into())]),
        body: Some("{oops".into()),
        ..Default::default()
    };
    let status = h.relay.webhook("w", request).await.unwrap();
    assert_eq!(status.code(), 400);
}

#[tokio::test]
async fn test_add_updates_acknowledged_without_echo() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d1", WatchBranch::new("u").updates()).await;
    h.watch("d2", WatchBranch::new("u").updates()).await;
    h.messenger.clear().await;

    h.relay
        .add_updates(
            "d1",
            AddUpdates {
                branch: "u".into(),
                updates: vec!["u1".into(), "u2".into()],
                update_id: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        h.received("d1").await,
        vec![ServerMessage::UpdatesReceived(UpdatesReceived {
            branch: "u".into(),
            update_id: 0,
            error_code: None,
        })]
    );
    let received = h.received("d2").await;
    let [ServerMessage::AddUpdates(add)] = received.as_slice() else {
        panic!("expected one add_updates, got {received:?}");
    };
    assert_eq!(add.updates, vec!["u1".to_string(), "u2".to_string()]);
}

// ─── Atoms ──────────────────────────────────────────────────

#[tokio::test]
async fn test_add_atoms_broadcast_excludes_sender() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.device("d3").await;
    h.watch("d1", WatchBranch::new("b")).await;
    h.watch("d2", WatchBranch::new("b")).await;
    h.watch("d3", WatchBranch::new("b").updates()).await;
    h.messenger.clear().await;

    let atoms = bot_atoms("s1", "b1");
    h.add("d1", "b", atoms.clone()).await;

    assert_eq!(names(&h.received("d1").await), vec!["repo/atoms_received"]);
    assert_eq!(
        h.received("d2").await,
        vec![ServerMessage::AddAtoms(AddAtoms::new("b", atoms))]
    );
    assert!(h.received("d3").await.is_empty(), "updates watchers get no atoms");
}

#[tokio::test]
async fn test_atoms_received_lists_added_then_removed() {
    let h = harness();
    h.device("d1").await;
    let atoms = bot_atoms("s1", "b1");
    h.add("d1", "b", atoms.clone()).await;
    h.messenger.clear().await;

    let extra = atomize_bot("s2", 10, "b2", &BotTags::new());
    h.relay
        .add_atoms(
            "d1",
            AddAtoms {
                branch: Some("b".into()),
                atoms: Some(extra.clone()),
                removed_atoms: Some(vec![atoms[2].hash.clone()]),
                initial: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        h.received("d1").await,
        vec![ServerMessage::AtomsReceived(AtomsReceived {
            branch: "b".into(),
            hashes: vec![extra[0].hash.clone(), atoms[2].hash.clone()],
        })]
    );
    assert_eq!(h.branch_atoms("b").await, 3);
}

#[tokio::test]
async fn test_add_atoms_is_idempotent() {
    let h = harness();
    h.device("d1").await;
    let atoms = bot_atoms("s1", "b1");
    h.add("d1", "b", atoms.clone()).await;
    h.add("d1", "b", atoms).await;
    assert_eq!(h.branch_atoms("b").await, 3);
}

#[tokio::test]
async fn test_setup_branch_seeds_empty_target() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d2", WatchBranch::new("target")).await;
    h.messenger.clear().await;

    let seed_tags = tags(&[("name", json!("seeded"))]);
    let seed = Atom::new(
        AtomId::new("s1", 1),
        None,
        setup_branch_op("target", Some("bot-1"), &seed_tags),
    );
    h.add("d1", "source", vec![seed.clone()]).await;

    assert_eq!(h.branch_atoms("source").await, 0, "seed atoms are not stored");
    assert_eq!(h.branch_atoms("target").await, 3);

    let received = h.received("d2").await;
    let [ServerMessage::AddAtoms(add)] = received.as_slice() else {
        panic!("expected seeded atoms, got {received:?}");
    };
    assert_eq!(add.branch.as_deref(), Some("target"));
    assert_eq!(add.atoms.as_ref().map(Vec::len), Some(3));

    // A second seed does not touch a branch that already has data.
    let again = Atom::new(
        AtomId::new("s1", 2),
        None,
        setup_branch_op("target", Some("bot-2"), &seed_tags),
    );
    h.add("d1", "source", vec![again]).await;
    assert_eq!(h.branch_atoms("target").await, 3);
}

// ─── Presence ───────────────────────────────────────────────

#[tokio::test]
async fn test_presence_notifications() {
    let h = harness();
    for id in ["d1", "d2", "watcher"] {
        h.device(id).await;
    }
    h.watch("d1", WatchBranch::new("b").temporary()).await;

    h.relay.watch_branch_devices("watcher", "b").await.unwrap();
    h.watch("d2", WatchBranch::new("b")).await;
    // Re-watching does not announce the device twice.
    h.watch("d2", WatchBranch::new("b")).await;
    h.relay.unwatch_branch("d2", "b").await.unwrap();
    h.relay.disconnect("d1").await.unwrap();

    let received = h.received("watcher").await;
    assert_eq!(
        names(&received),
        vec![
            "repo/device_connected_to_branch",
            "repo/device_connected_to_branch",
            "repo/device_disconnected_from_branch",
            "repo/device_disconnected_from_branch",
        ]
    );
    let ServerMessage::DeviceConnectedToBranch(first) = &received[0] else {
        unreachable!()
    };
    assert_eq!(first.device.connection_id, "d1");
    assert!(first.branch.temporary);
    let ServerMessage::DeviceDisconnectedFromBranch(last) = &received[3] else {
        unreachable!()
    };
    assert_eq!(last.device.connection_id, "d1");
}

#[tokio::test]
async fn test_unwatch_branch_devices_stops_notifications() {
    let h = harness();
    h.device("d1").await;
    h.device("watcher").await;
    h.relay.watch_branch_devices("watcher", "b").await.unwrap();
    h.relay.unwatch_branch_devices("watcher", "b").await.unwrap();

    h.watch("d1", WatchBranch::new("b")).await;
    assert!(h.received("watcher").await.is_empty());
}

#[tokio::test]
async fn test_device_count() {
    let h = harness();
    for id in ["d1", "d2", "d3"] {
        h.device(id).await;
    }
    h.watch("d1", WatchBranch::new("b")).await;
    h.watch("d2", WatchBranch::new("b")).await;
    h.messenger.clear().await;

    h.relay.device_count("d3", Some("b")).await.unwrap();
    h.relay.device_count("d3", None).await.unwrap();

    let received = h.received("d3").await;
    let counts: Vec<(Option<String>, usize)> = received
        .into_iter()
        .map(|msg| match msg {
            ServerMessage::DeviceCount(count) => (count.branch, count.count),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(counts, vec![(Some("b".into()), 2), (None, 3)]);
}

// ─── Delivery failures ──────────────────────────────────────

#[tokio::test]
async fn test_stale_recipient_purged_with_gc() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d1", WatchBranch::new("t").temporary()).await;
    h.watch("d2", WatchBranch::new("t").temporary()).await;
    h.messenger.fail("d2").await;

    h.add("d1", "t", bot_atoms("s1", "b1")).await;

    assert!(h.connections.get_connection("d2").await.unwrap().is_none());
    assert_eq!(
        h.connections
            .count_connections_by_namespace("/branch/t")
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.branch_atoms("t").await, 3, "d1 still watches");

    h.relay.unwatch_branch("d1", "t").await.unwrap();
    assert_eq!(h.branch_atoms("t").await, 0);
}

#[tokio::test]
async fn test_purged_watcher_announced_as_disconnected_once() {
    let h = harness();
    for id in ["d1", "d2", "watcher"] {
        h.device(id).await;
    }
    h.relay.watch_branch_devices("watcher", "b").await.unwrap();
    h.watch("d1", WatchBranch::new("b")).await;
    h.watch("d2", WatchBranch::new("b")).await;
    h.messenger.fail("d2").await;

    h.add("d1", "b", bot_atoms("s1", "b1")).await;
    h.relay.disconnect("d2").await.unwrap();

    let received = h.received("watcher").await;
    assert_eq!(
        names(&received),
        vec![
            "repo/device_connected_to_branch",
            "repo/device_connected_to_branch",
            "repo/device_disconnected_from_branch",
        ]
    );
    let ServerMessage::DeviceDisconnectedFromBranch(left) = &received[2] else {
        unreachable!()
    };
    assert_eq!(left.device.connection_id, "d2");
}

#[tokio::test]
async fn test_unreachable_watcher_never_announced() {
    let h = harness();
    h.device("d1").await;
    h.device("watcher").await;
    h.relay.watch_branch_devices("watcher", "t").await.unwrap();
    h.messenger.fail("d1").await;

    h.watch("d1", WatchBranch::new("t").temporary()).await;

    assert!(h.received("watcher").await.is_empty());
    assert!(h.connections.get_connection("d1").await.unwrap().is_none());
    assert_eq!(
        h.connections
            .count_connections_by_namespace("/branch/t")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_stale_presence_subscriber_purged_during_purge() {
    let h = harness();
    for id in ["d1", "d2", "watcher"] {
        h.device(id).await;
    }
    h.watch("d1", WatchBranch::new("b")).await;
    h.watch("d2", WatchBranch::new("b")).await;
    h.relay.watch_branch_devices("watcher", "b").await.unwrap();
    h.messenger.fail("d2").await;
    h.messenger.fail("watcher").await;

    h.add("d1", "b", bot_atoms("s1", "b1")).await;

    assert!(h.connections.get_connection("d2").await.unwrap().is_none());
    assert!(h.connections.get_connection("watcher").await.unwrap().is_none());
    assert!(h.connections.get_connection("d1").await.unwrap().is_some());
}

// ─── Remote action routing ──────────────────────────────────

#[tokio::test]
async fn test_event_selectors() {
    let h = harness();
    for id in ["d1", "d2", "d3"] {
        h.device(id).await;
        h.watch(id, WatchBranch::new("b")).await;
    }

    let send = |selector: DeviceSelector| SendEvent {
        branch: "b".into(),
        action: RemoteAction::remote(json!("ping"), selector),
    };
    let events_for = |messages: Vec<ServerMessage>| {
        messages
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::ReceiveEvent(_)))
            .count()
    };

    h.relay.send_event("d1", send(DeviceSelector::device("d2"))).await.unwrap();
    assert_eq!(events_for(h.received("d2").await), 1);

    h.relay.send_event("d1", send(DeviceSelector::username("user-d3"))).await.unwrap();
    assert_eq!(events_for(h.received("d3").await), 1);

    h.relay.send_event("d1", send(DeviceSelector::broadcast())).await.unwrap();
    assert_eq!(events_for(h.received("d1").await), 1);
    assert_eq!(events_for(h.received("d2").await), 2);
    assert_eq!(events_for(h.received("d3").await), 2);

    // No selector: one watcher chosen by the random source.
    h.random.set(0);
    h.relay.send_event("d2", send(DeviceSelector::default())).await.unwrap();
    assert_eq!(events_for(h.received("d1").await), 2);
}

#[tokio::test]
async fn test_remote_result_carries_task_id() {
    let h = harness();
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d2", WatchBranch::new("b")).await;
    h.messenger.clear().await;

    let action = RemoteAction::result(json!(42), DeviceSelector::device("d2"), "task-1");
    h.relay
        .send_event("d1", SendEvent { branch: "b".into(), action })
        .await
        .unwrap();

    let received = h.received("d2").await;
    let [ServerMessage::ReceiveEvent(event)] = received.as_slice() else {
        panic!("expected one receive_event");
    };
    assert_eq!(event.action.task_id.as_deref(), Some("task-1"));
    let encoded = ServerMessage::ReceiveEvent(event.clone()).encode().unwrap();
    assert!(encoded.contains(r#""type":"device_result""#));
}

// ─── Updates ────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_size_limit() {
    let h = harness_with_updates(MemoryUpdatesStore::with_max_bytes(8));
    h.device("d1").await;
    h.device("d2").await;
    h.watch("d2", WatchBranch::new("u").updates()).await;
    h.messenger.clear().await;

    h.relay
        .add_updates(
            "d1",
            AddUpdates {
                branch: "u".into(),
                updates: vec!["this update is too large".into()],
                update_id: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        h.received("d1").await,
        vec![ServerMessage::UpdatesReceived(UpdatesReceived {
            branch: "u".into(),
            update_id: 7,
            error_code: Some(MAX_SIZE_REACHED.into()),
        })]
    );
    assert!(h.received("d2").await.is_empty());
    assert!(h.updates.get_updates("u").await.unwrap().updates.is_empty());
}

#[tokio::test]
async fn test_get_updates_snapshot_and_ack() {
    let h = harness();
    h.device("d1").await;
    h.clock.set(5_000);
    h.relay
        .add_updates(
            "d1",
            AddUpdates {
                branch: "u".into(),
                updates: vec!["a".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.messenger.clear().await;

    h.relay
        .get_updates("d1", GetUpdates { branch: "u".into(), update_id: Some(3) })
        .await
        .unwrap();

    let received = h.received("d1").await;
    let [ServerMessage::AddUpdates(snapshot), ServerMessage::UpdatesReceived(ack)] =
        received.as_slice()
    else {
        panic!("unexpected messages {received:?}");
    };
    assert_eq!(snapshot.updates, vec!["a".to_string()]);
    assert_eq!(snapshot.timestamps, Some(vec![5_000]));
    assert_eq!(snapshot.initial, Some(true));
    assert_eq!(ack.update_id, 3);
}

#[tokio::test]
async fn test_branch_data_folds_updates() {
    let h = harness();
    h.device("d1").await;

    let mut doc = BotsDoc::new();
    let first = doc.apply_actions(vec![BotAction::AddBot {
        id: "b1".into(),
        tags: tags(&[("color", json!("red"))]),
    }]);
    let second = doc.apply_actions(vec![BotAction::UpdateBot {
        id: "b1".into(),
        tags: tags(&[("color", json!("blue"))]),
    }]);
    h.relay
        .add_updates(
            "d1",
            AddUpdates {
                branch: "data".into(),
                updates: vec![encode_update(&first), encode_update(&second)],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let data = h.relay.get_branch_data("data").await.unwrap();
    assert_eq!(data.version, 1);
    assert_eq!(data.state["b1"].tag("color"), Some(&json!("blue")));

    let empty = h.relay.get_branch_data("nothing").await.unwrap();
    assert!(empty.state.is_empty());
}

// ─── Dispatch ───────────────────────────────────────────────

#[tokio::test]
async fn test_handle_message_dispatch() {
    let h = harness();
    h.relay
        .handle_message(
            "c1",
            ClientMessage::Login(Login {
                session_id: "s".into(),
                username: "u".into(),
                token: Some("opaque".into()),
            }),
            0,
        )
        .await
        .unwrap();
    h.relay
        .handle_message("c1", ClientMessage::WatchBranch(WatchBranch::new("b")), 0)
        .await
        .unwrap();
    h.clock.set(2_000);
    h.relay
        .handle_message(
            "c1",
            ClientMessage::SyncTime(SyncTimeRequest { id: 9, client_request_time: 100 }),
            1_500,
        )
        .await
        .unwrap();

    let received = h.received("c1").await;
    assert_eq!(
        names(&received),
        vec!["login_result", "repo/add_atoms", "sync/time/response"]
    );
    let ServerMessage::SyncTime(time) = &received[2] else {
        unreachable!()
    };
    assert_eq!(time.id, 9);
    assert_eq!(time.client_request_time, 100);
    assert_eq!(time.server_receive_time, 1_500);
    assert_eq!(time.server_transmit_time, 2_000);

    let stored = h.connections.get_connection("c1").await.unwrap().unwrap();
    assert_eq!(stored.token.as_deref(), Some("opaque"));
}

#[tokio::test]
async fn test_unknown_connection_and_branch_are_no_ops() {
    let h = harness();
    h.watch("ghost", WatchBranch::new("b")).await;
    h.relay.unwatch_branch("ghost", "b").await.unwrap();
    h.relay.disconnect("ghost").await.unwrap();

    assert!(h.messenger.all_messages().await.is_empty());
    assert_eq!(
        h.connections
            .count_connections_by_namespace("/branch/b")
            .await
            .unwrap(),
        0
    );
}

// ─── Store failures ─────────────────────────────────────────

struct BrokenAtomStore;

#[async_trait]
impl AtomStore for BrokenAtomStore {
    async fn save_atoms(&self, _: &str, _: &[Atom]) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn load_atoms(&self, _: &str) -> Result<Vec<Atom>, StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn count_atoms(&self, _: &str) -> Result<usize, StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn delete_atoms(&self, _: &str, _: &[String]) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }

    async fn clear_namespace(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("disk on fire".into()))
    }
}

#[tokio::test]
async fn test_store_errors_propagate() {
    let messenger = Arc::new(MemoryMessenger::new());
    let relay = CausalRepoServer::new(
        Arc::new(BrokenAtomStore),
        Arc::new(MemoryUpdatesStore::new()),
        Arc::new(MemoryConnectionStore::new()),
        messenger.clone(),
    );
    relay
        .connect(DeviceConnection::new("d1", "s", "u"))
        .await
        .unwrap();

    let result = relay.add_atoms("d1", AddAtoms::new("b", bot_atoms("s1", "b1"))).await;
    assert!(matches!(result, Err(RelayError::Store(StoreError::Backend(_)))));
    assert!(
        messenger.messages_for("d1").await.is_empty(),
        "no ack for data that was not stored"
    );

    let webhook = relay.webhook("b", WebhookRequest::default()).await;
    assert!(webhook.is_err());
}
