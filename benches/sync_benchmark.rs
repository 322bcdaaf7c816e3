use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use uuid::Uuid;

use tessera_sync::entity::{DatabaseCell, DatabaseRow, Document};
use tessera_sync::ledger::OptimisticLedger;
use tessera_sync::membership::RoomGroup;
use tessera_sync::protocol::{Envelope, Event, RoomId, WireMessage};
use tessera_sync::store::{DatabaseStore, DocumentStore, StoreContext};

fn sample_envelope() -> Envelope {
    Envelope::new(
        RoomId::database("db1"),
        Uuid::new_v4(),
        Some("user-1".to_string()),
        Event::CellUpdate {
            database_id: "db1".to_string(),
            row_id: "row-1".to_string(),
            property_id: "propA".to_string(),
            value: serde_json::json!({"text": "benchmark payload", "n": 42}),
        },
    )
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = sample_envelope();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = sample_envelope().encode().unwrap();

    c.bench_function("envelope_decode", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_wire_frame_roundtrip(c: &mut Criterion) {
    c.bench_function("wire_frame_roundtrip", |b| {
        b.iter(|| {
            let frame = WireMessage::Event(sample_envelope()).encode().unwrap();
            black_box(WireMessage::decode(&frame).unwrap());
        })
    });
}

fn bench_tree_lookup(c: &mut Criterion) {
    let ctx = StoreContext::new(OptimisticLedger::new());
    let store = DocumentStore::new(ctx);

    // A 3-level tree, 10 roots with 10 children with 10 grandchildren.
    for i in 0..10 {
        let root_id = format!("root-{i}");
        store.apply_remote_create(Document::new(&root_id, "Root"), None);
        for j in 0..10 {
            let mid_id = format!("mid-{i}-{j}");
            store.apply_remote_create(Document::new(&mid_id, "Mid"), Some(root_id.clone()));
            for k in 0..10 {
                store.apply_remote_create(
                    Document::new(format!("leaf-{i}-{j}-{k}"), "Leaf"),
                    Some(mid_id.clone()),
                );
            }
        }
    }

    c.bench_function("tree_lookup_1k_docs", |b| {
        b.iter(|| {
            black_box(store.find_document(black_box("leaf-9-9-9")));
        })
    });
}

fn bench_cell_upsert(c: &mut Criterion) {
    let ctx = StoreContext::new(OptimisticLedger::new());
    let store = DatabaseStore::new(ctx);
    for i in 0..100 {
        let mut row = DatabaseRow::new(format!("row-{i}"), "db1", i);
        for p in 0..10 {
            row.cells
                .push(DatabaseCell::new(format!("prop-{p}"), serde_json::json!(p)));
        }
        store.apply_remote_row_create(row);
    }

    c.bench_function("cell_upsert_100x10", |b| {
        b.iter(|| {
            store.apply_remote_cell_update(
                black_box("db1"),
                black_box("row-50"),
                black_box("prop-5"),
                serde_json::json!("updated"),
            );
        })
    });
}

fn bench_room_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = Arc::new(RoomGroup::new(1024));
    let origin = Uuid::new_v4();

    // 16 subscribers with drained receivers.
    let receivers: Vec<_> = rt.block_on(async {
        let mut rxs = Vec::new();
        for _ in 0..16 {
            rxs.push(group.join(Uuid::new_v4(), None).await);
        }
        rxs
    });

    let frame = Arc::new(sample_envelope().encode().unwrap());
    c.bench_function("room_publish_16_members", |b| {
        b.iter(|| {
            black_box(group.publish(black_box(origin), frame.clone()));
        })
    });
    drop(receivers);
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_wire_frame_roundtrip,
    bench_tree_lookup,
    bench_cell_upsert,
    bench_room_fanout,
);
criterion_main!(benches);
