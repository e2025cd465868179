//! Command ring benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use vox_core::NodeId;
use vox_event::{Action, ActionRecord, command_ring};

fn bench_post_and_drain(c: &mut Criterion) {
    let (writer, mut reader) = command_ring(64 * 1024);
    let record = ActionRecord::new(Action::play(NodeId(100)).with_delay_ms(20.0), 1, 1);
    let payload = record.to_bytes();
    let tag = record.tag();

    c.bench_function("ring_post_drain_64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                let _ = writer.post(tag, black_box(&payload));
            }
            let mut n = 0;
            reader.drain(|_, p| n += p.len());
            black_box(n)
        })
    });
}

fn bench_encode_decode(c: &mut Criterion) {
    let record = ActionRecord::new(Action::stop(NodeId(7)), 3, 9);

    c.bench_function("record_encode_decode", |b| {
        b.iter(|| {
            let bytes = black_box(&record).to_bytes();
            black_box(ActionRecord::decode(record.tag(), &bytes).ok())
        })
    });
}

criterion_group!(benches, bench_post_and_drain, bench_encode_decode);
criterion_main!(benches);
