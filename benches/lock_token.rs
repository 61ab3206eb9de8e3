// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for the lock token codec and the acquire/release cycle.
//!
//! Run with: `cargo bench --bench lock_token`

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tempfile::TempDir;

use agentdesk::config::LockSettings;
use agentdesk::lock::{LockToken, WorkspaceLockManager};

fn sample_token() -> LockToken {
    LockToken::new(
        "agentdesk",
        "2f9c1d4e-7a1b-4c55-9d0e-3b8f6a2c1e77",
        48_213,
        "build-host-07",
        "/home/dev/projects/agentdesk",
        1_760_000_000_000,
    )
}

/// Encoding and decoding of the on-disk token.
fn bench_codec(c: &mut Criterion) {
    let token = sample_token();
    let encoded = token.encode();

    let mut group = c.benchmark_group("lock_token");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode", |b| {
        b.iter(|| black_box(&token).encode());
    });

    group.bench_function("decode", |b| {
        b.iter(|| LockToken::decode(black_box(&encoded)));
    });

    let corrupt = encoded.replace("\"version\": 1", "\"version\": 9");
    group.bench_function("decode_rejected", |b| {
        b.iter(|| LockToken::decode(black_box(&corrupt)));
    });

    group.bench_function("refresh_and_encode", |b| {
        b.iter(|| token.refreshed(black_box(1_760_000_005_000)).encode());
    });

    group.finish();
}

/// Full acquire plus release against a temporary workspace.
fn bench_acquire_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let manager = runtime.block_on(async { WorkspaceLockManager::new(LockSettings::default()) });

    c.bench_function("lock_acquire_release", |b| {
        b.to_async(&runtime).iter(|| async {
            let acquired = manager.acquire(black_box(dir.path())).await;
            assert!(acquired.is_ok());
            manager.release(dir.path()).await
        });
    });
}

criterion_group!(benches, bench_codec, bench_acquire_release);
criterion_main!(benches);
