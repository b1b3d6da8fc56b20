// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry Lookup Benchmark
//!
//! Measures `SubscriptionContext::with_change_group` lookup and priority
//! sort cost (§4.C, §4.F) as the number of change subscribers on one
//! `(module, datastore)` group grows, since every commit wave walks this
//! group under a read lock.

#![allow(clippy::uninlined_format_args)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use srsub::callbacks::ChangeCallback;
use srsub::error::ErrorInfo;
use srsub::registry::{ChangeSubFlags, SubscriptionContext};
use srsub::types::{Datastore, EventKind, Priority, SessionId};
use srsub::Config;
use std::hint::black_box as bb;
use std::sync::Arc;

struct NoopChangeCallback;

impl ChangeCallback for NoopChangeCallback {
    fn on_event(&self, _kind: EventKind, _request_id: u32, _diff: &[u8]) -> Result<(), ErrorInfo> {
        Ok(())
    }
}

fn context(dir: &std::path::Path) -> SubscriptionContext {
    let config = Arc::new(Config::builder().run_dir(dir).build());
    SubscriptionContext::new(config)
}

fn bench_with_change_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_with_change_group");
    for count in [1usize, 16, 64, 256] {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        for i in 0..count {
            let cb = Arc::new(NoopChangeCallback);
            ctx.add_change(
                SessionId(1),
                "ietf-interfaces",
                Datastore::Running,
                None,
                cb,
                Priority((i % 8) as i32),
                ChangeSubFlags::default(),
            )
            .unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                ctx.with_change_group("ietf-interfaces", Datastore::Running, |group| {
                    bb(group.map(|g| g.subs.len()));
                });
            });
        });
    }
    group.finish();
}

fn bench_add_change(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_add_change");
    group.bench_function("single_subscribe", |b| {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let mut n = 0u32;
        b.iter(|| {
            n += 1;
            let cb = Arc::new(NoopChangeCallback);
            let sub_id = ctx
                .add_change(SessionId(1), "m", Datastore::Running, None, cb, Priority(0), ChangeSubFlags::default())
                .unwrap();
            bb(sub_id);
            ctx.del_change(sub_id).unwrap();
            bb(n);
        });
    });
    group.finish();
}

criterion_group!(registry_benches, bench_with_change_group, bench_add_change);
criterion_main!(registry_benches);
