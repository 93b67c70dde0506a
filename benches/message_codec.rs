// SPDX-License-Identifier: MIT OR Apache-2.0
//! Benchmarks for message encoding, decoding and broadcast fan-out.

use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group,
    criterion_main,
};
use subflow::{Broadcast, CancellationToken, JsonlCodec, Message, MessageKind};

// ── Helpers ─────────────────────────────────────────────────────────────

fn stdout_message(size: usize) -> Message {
    Message::stdout("x".repeat(size))
}

fn recording(count: usize) -> String {
    let mut out = JsonlCodec::encode(&Message::start()).unwrap();
    for i in 0..count {
        out.push_str(&JsonlCodec::encode(&Message::stdout(format!("line {i}\n"))).unwrap());
    }
    out.push_str(&JsonlCodec::encode(&Message::exit(0)).unwrap());
    out
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [16, 1024, subflow::CHUNK_SIZE] {
        let msg = stdout_message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &msg, |b, msg| {
            b.iter(|| JsonlCodec::encode(black_box(msg)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [16, 1024, subflow::CHUNK_SIZE] {
        let line = JsonlCodec::encode(&stdout_message(size)).unwrap();
        group.throughput(Throughput::Bytes(line.len() as u64));
        group.bench_with_input(BenchmarkId::new("any", size), &line, |b, line| {
            b.iter(|| JsonlCodec::decode(black_box(line)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("as_stdout", size), &line, |b, line| {
            b.iter(|| JsonlCodec::decode_as(MessageKind::Stdout, black_box(line)).unwrap());
        });
    }
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let text = recording(1_000);
    c.bench_function("decode_stream/1000", |b| {
        b.iter(|| {
            JsonlCodec::decode_stream(black_box(text.as_bytes()))
                .filter(Result::is_ok)
                .count()
        });
    });
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_push");
    for listeners in [1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &listeners,
            |b, &listeners| {
                let scope = CancellationToken::new();
                let msg = stdout_message(64);
                b.iter_batched(
                    || {
                        let bus = Broadcast::<Message>::new();
                        let subs: Vec<_> = (0..listeners).map(|_| bus.listen(&scope)).collect();
                        (bus, subs)
                    },
                    |(bus, subs)| {
                        bus.push(std::iter::repeat_n(msg.clone(), 100));
                        (bus, subs)
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_decode_stream,
    bench_broadcast
);
criterion_main!(benches);
