//! Selection benchmarks: cost of one `Strategy::next` on a pool snapshot
//!
//! Measures the hot path only. Round robin's cycle is built once per
//! snapshot version, so steady state is a version compare plus a cursor bump.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use isoswitch_core::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;

const POOL_SIZES: &[usize] = &[4, 32, 256];

fn pool_of(size: usize) -> ConnectionPool {
    let pool = ConnectionPool::new(SocketKey::client("bench"), AccessList::allow_all());
    let local: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    for i in 0..size {
        let remote: SocketAddr = format!("10.0.{}.{}:6000", i / 250, i % 250 + 1).parse().unwrap();
        let endpoint = SocketEndpoint::from_addr(remote)
            .with_weight((i % 5) as u32 + 1)
            .with_priority((i % 2) as u32);
        let (conn, _rx) = Connection::new(SocketKey::client("bench"), endpoint, local, remote);
        // Vary load so least-connections has work to do
        for _ in 0..(i % 7) {
            conn.acquire();
        }
        pool.add_connection(conn);
    }
    pool
}

fn strategy_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection/next");
    let fields = FieldMap::new().with(41, "TERM0001");

    for &size in POOL_SIZES {
        let pool = pool_of(size);
        let snapshot = pool.candidates();

        for (name, kind) in [
            ("round_robin", StrategyKind::RoundRobin),
            ("least_connections", StrategyKind::LeastConnections),
            ("hash", StrategyKind::Hash { field: 41 }),
        ] {
            let strategy = Strategy::new(kind);
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, _| {
                b.iter(|| {
                    let picked = strategy.select(&snapshot, &fields).unwrap();
                    black_box(Arc::clone(&picked));
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, strategy_next);
criterion_main!(benches);
