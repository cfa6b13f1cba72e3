// Copyright (c) 2024 Botho Foundation

//! Benchmarks for the reply sizing decision.
//!
//! Run with: cargo bench -p cascade --bench reply_sizing
//!
//! The decision runs once per poll interval on the last relay over every
//! established channel, so it has to stay cheap for thousands of channels.

use cascade::{
    message::{encode_reply_payload, REPLY_HEADER_LEN},
    mixing::reply_sizing::{adjust_to_block, should_flush, weighted_median},
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Channel counts of a quiet, busy and saturated relay.
const CHANNEL_COUNTS: [usize; 3] = [16, 1024, 16384];

fn random_volumes(count: usize) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    (0..count).map(|_| rng.gen_range(0..8192)).collect()
}

/// Sort plus weighted median, as done for every flushed round.
fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reply size decision");

    for count in CHANNEL_COUNTS.iter() {
        let volumes = random_volumes(*count);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("channels", count), count, |b, _| {
            b.iter(|| {
                let mut sorted = volumes.clone();
                sorted.sort_unstable();
                let median = weighted_median(black_box(&sorted), 0.5);
                black_box(adjust_to_block(median.round() as usize, 16, REPLY_HEADER_LEN, 4096))
            })
        });
    }

    group.finish();
}

/// Flush check run on every poll.
fn bench_should_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("Flush check");

    for count in CHANNEL_COUNTS.iter() {
        let volumes = random_volumes(*count);

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::new("channels", count), count, |b, _| {
            b.iter(|| black_box(should_flush(black_box(&volumes), 4096, 0.5)))
        });
    }

    group.finish();
}

/// Building one padded reply payload.
fn bench_encode_reply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Reply encoding");

    for size in [44usize, 1020, 4092].iter() {
        let chunk = vec![0x5a; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("reply_size", size), size, |b, _| {
            b.iter(|| black_box(encode_reply_payload(black_box(&chunk), size / 2)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decide, bench_should_flush, bench_encode_reply);
criterion_main!(benches);
