use std::hint::black_box;
use std::sync::Arc;

use causal_collab::messenger::{ChannelMessenger, MemoryMessenger, Messenger};
use causal_collab::protocol::{AddAtoms, ClientMessage, DeviceCount, ServerMessage, WatchBranch};
use causal_collab::relay::CausalRepoServer;
use causal_collab::storage::{
    DeviceConnection, MemoryAtomStore, MemoryConnectionStore, MemoryUpdatesStore,
};
use causal_core::{atomize_bot, Atom, BotTags};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;

fn sample_atoms(site: &str, bots: usize) -> Vec<Atom> {
    let tags: BotTags = [
        ("color".to_string(), json!("red")),
        ("position".to_string(), json!({"x": 1, "y": 2})),
    ]
    .into_iter()
    .collect();
    (0..bots)
        .flat_map(|i| atomize_bot(site, (i * 10 + 1) as u64, &format!("bot-{i}"), &tags))
        .collect()
}

fn bench_frame_encode(c: &mut Criterion) {
    let message = ClientMessage::AddAtoms(AddAtoms::new("main", sample_atoms("s", 10)));

    c.bench_function("add_atoms_encode_50", |b| {
        b.iter(|| black_box(message.encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = ClientMessage::AddAtoms(AddAtoms::new("main", sample_atoms("s", 10)))
        .encode()
        .unwrap();

    c.bench_function("add_atoms_decode_50", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_channel_fan_out(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let messenger = ChannelMessenger::new(1024);
    let ids: Vec<String> = (0..100).map(|i| format!("conn-{i}")).collect();
    let mut receivers = rt.block_on(async {
        let mut receivers = Vec::new();
        for id in &ids {
            receivers.push(messenger.register(id).await);
        }
        receivers
    });
    let message = ServerMessage::DeviceCount(DeviceCount {
        branch: Some("main".into()),
        count: 100,
    });

    c.bench_function("fan_out_100_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let report = messenger.send_message(&ids, &message, None).await.unwrap();
                black_box(report);
                for rx in receivers.iter_mut() {
                    let _ = rx.try_recv();
                }
            })
        })
    });
}

fn bench_relay_add_atoms(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let messenger = Arc::new(MemoryMessenger::new());
    let relay = CausalRepoServer::new(
        Arc::new(MemoryAtomStore::new()),
        Arc::new(MemoryUpdatesStore::new()),
        Arc::new(MemoryConnectionStore::new()),
        messenger.clone(),
    );
    rt.block_on(async {
        for i in 0..10 {
            let id = format!("d{i}");
            relay
                .connect(DeviceConnection::new(&id, "session", "user"))
                .await
                .unwrap();
            relay.watch_branch(&id, WatchBranch::new("main")).await.unwrap();
        }
    });

    let mut site = 0u64;
    c.bench_function("relay_add_atoms_10_watchers", |b| {
        b.iter(|| {
            site += 1;
            let atoms = sample_atoms(&site.to_string(), 1);
            rt.block_on(async {
                relay
                    .add_atoms("d0", AddAtoms::new("main", atoms))
                    .await
                    .unwrap();
                messenger.clear().await;
            })
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_channel_fan_out,
    bench_relay_add_atoms,
);
criterion_main!(benches);
