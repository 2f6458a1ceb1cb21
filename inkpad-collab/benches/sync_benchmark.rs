use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use inkpad_collab::merge::{Edit, MergeEngine};
use inkpad_collab::protocol::SyncMessage;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let update = vec![0u8; 64]; // Typical small update

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(peer),
                black_box(doc),
                black_box(1),
                black_box(update.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let msg = SyncMessage::update(peer, doc, 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_merge_local_edit(c: &mut Criterion) {
    let doc = Uuid::new_v4();

    c.bench_function("merge_local_insert", |b| {
        b.iter_batched(
            || MergeEngine::new(doc, "The quick brown fox"),
            |mut engine| {
                black_box(
                    engine
                        .apply_edit(&Edit::Insert { index: 9, text: " very".into() })
                        .unwrap(),
                );
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_merge_apply_remote(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let mut source = MergeEngine::new(doc, "The quick brown fox");
    let update = source
        .apply_edit(&Edit::Insert { index: 9, text: " very".into() })
        .unwrap();

    c.bench_function("merge_apply_remote", |b| {
        b.iter_batched(
            || MergeEngine::new(doc, "The quick brown fox"),
            |mut engine| {
                engine.apply_remote(black_box(&update)).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_handshake_diff(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let mut ahead = MergeEngine::new(doc, "shared baseline");
    for i in 0..50 {
        ahead
            .apply_edit(&Edit::Insert { index: 0, text: format!("{i} ") })
            .unwrap();
    }
    let behind = MergeEngine::new(doc, "shared baseline");
    let sv = behind.state_vector();

    c.bench_function("handshake_diff_50_edits", |b| {
        b.iter(|| {
            black_box(ahead.diff(black_box(&sv)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_merge_local_edit,
    bench_merge_apply_remote,
    bench_handshake_diff,
);
criterion_main!(benches);
