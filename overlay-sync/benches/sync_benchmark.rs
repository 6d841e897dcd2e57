use criterion::{black_box, criterion_group, criterion_main, Criterion};
use overlay_core::{Item, ItemKind};
use overlay_sync::{correlation_id, Envelope, Request, ServerMessage};
use serde_json::json;

fn bench_decode_broadcast(c: &mut Criterion) {
    let frame = json!({
        "action": "update_property",
        "media_id": "item-50",
        "property": "position",
        "value": {"x": 640.0, "y": 360.0},
        "version": 1042,
        "checksum": "0badf00d",
    })
    .to_string();

    c.bench_function("decode_update_broadcast", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&frame))))
    });
}

fn bench_decode_snapshot(c: &mut Criterion) {
    let items: serde_json::Map<String, serde_json::Value> = (0..100)
        .map(|i| {
            let id = format!("item-{i}");
            let item = json!({"id": id, "type": "image", "z_index": i});
            (id, item)
        })
        .collect();
    let frame = json!({
        "action": "sync_state",
        "state": {"items": items},
        "version": 7,
        "checksum": "00000007",
    })
    .to_string();

    c.bench_function("decode_snapshot_100_items", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&frame))))
    });
}

fn bench_encode_request(c: &mut Criterion) {
    let draft = Item::media(ItemKind::Video, "clip.mp4", "/uploads/clip.mp4");

    c.bench_function("encode_add_media_request", |b| {
        b.iter(|| {
            let envelope = Envelope::new(
                Request::AddMedia {
                    media: draft.clone(),
                },
                Some(correlation_id()),
            );
            black_box(envelope.encode())
        })
    });
}

criterion_group!(
    benches,
    bench_decode_broadcast,
    bench_decode_snapshot,
    bench_encode_request,
);
criterion_main!(benches);
