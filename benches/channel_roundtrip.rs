// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel Roundtrip Benchmark
//!
//! Measures the cost of a single `publish` / `snapshot_payload` /
//! `post_reply` cycle on a mapped event channel (§4.E), at a few payload
//! sizes, to track the overhead the Commit Protocol Engine pays per wave.

#![allow(clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use srsub::channel::Channel;
use srsub::types::EventKind;
use std::hint::black_box as bb;

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_publish");
    for size in [64, 256, 1024, 4096] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sr");
        let channel = Channel::create(&path, 4096, 8, 4096).unwrap();
        let payload = vec![0xABu8; size];

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                channel.publish(EventKind::Change, 1, 0, 1, 1, bb(&payload)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_snapshot_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_snapshot_payload");
    for size in [64, 256, 1024, 4096] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.sr");
        let channel = Channel::create(&path, 4096, 8, 4096).unwrap();
        let payload = vec![0xABu8; size];
        channel.publish(EventKind::Change, 1, 0, 1, 1, &payload).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                bb(channel.snapshot_payload().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_publish_reply_roundtrip");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.sr");
    let channel = Channel::create(&path, 256, 8, 4096).unwrap();
    let payload = vec![0xCDu8; 256];
    let mut request_id = 0u32;

    group.bench_function("publish_then_three_replies", |b| {
        b.iter(|| {
            request_id += 1;
            channel.publish(EventKind::Change, request_id, 0, 1, 1, &payload).unwrap();
            let snapshot = channel.snapshot_payload().unwrap();
            bb(&snapshot);
            for sub_id in 0..3 {
                channel.post_reply(sub_id, 0, "").unwrap();
            }
            bb(channel.replies());
        });
    });
    group.finish();
}

criterion_group!(channel_benches, bench_publish, bench_snapshot_payload, bench_roundtrip);
criterion_main!(channel_benches);
