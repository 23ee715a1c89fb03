//! Entities Benchmarks
//!
//! - add / get against a populated collection
//! - filtered pagination
//! - index lookups
//! - flush throughput
//! - reload time by record count
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench entities_bench
//! cargo bench --bench entities_bench -- "entities/get"
//! ```

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lodestore_entities::{Entities, Record, StoreConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

// =============================================================================
// Constants and Configuration
// =============================================================================

/// Fixed seed for deterministic key selection.
const BENCH_SEED: u64 = 0xDEADBEEF_CAFEBABE;

const RECORD_COUNTS: &[u32] = &[1_000, 10_000, 100_000];

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
struct User {
    id: String,
    username: String,
    email: String,
    team: u32,
}

impl Record for User {
    fn key(&self) -> &str {
        &self.id
    }
}

fn user(id: u32) -> User {
    User {
        id: id.to_string(),
        username: format!("user{}", id),
        email: format!("user{}@example.com", id),
        team: id % 100,
    }
}

/// Flushing is driven by the benchmarks, not the background thread.
fn bench_config() -> StoreConfig {
    StoreConfig::default().with_flush_interval(Duration::from_secs(3600))
}

fn populated(count: u32) -> (Entities<User>, TempDir) {
    let dir = TempDir::new().unwrap();
    let users = Entities::open(dir.path(), bench_config()).unwrap();
    users.add_many((0..count).map(user));
    users.flush_now().unwrap();
    (users, dir)
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_crud(c: &mut Criterion) {
    let mut group = c.benchmark_group("entities");
    let (users, _dir) = populated(10_000);
    let mut rng = StdRng::seed_from_u64(BENCH_SEED);

    group.throughput(Throughput::Elements(1));
    group.bench_function("get/hit", |b| {
        b.iter(|| {
            let id = rng.gen_range(0..10_000u32);
            black_box(users.get(&id.to_string()))
        })
    });
    group.bench_function("get/miss", |b| b.iter(|| black_box(users.get("absent"))));

    let mut next = 10_000u32;
    group.bench_function("add", |b| {
        b.iter(|| {
            users.add(user(next));
            next += 1;
        })
    });
    group.finish();
}

fn bench_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("entities/query");
    let (users, _dir) = populated(10_000);
    let by_team = users.create_index("team", |u: &User| u.team.to_string());
    by_team.backfill();

    group.bench_function("range_filter/page", |b| {
        b.iter(|| black_box(users.range_filter(100, 120, |u| u.team == 7).count()))
    });
    group.bench_function("filter_limit/10", |b| {
        b.iter(|| black_box(users.filter_limit(10, |u| u.team == 42).count()))
    });
    group.bench_function("index/each", |b| b.iter(|| black_box(by_team.each("42").count())));
    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("entities/flush");
    group.sample_size(10);

    for &count in &[1_000u32, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let (users, _dir) = populated(0);
            b.iter(|| {
                users.add_many((0..count).map(user));
                black_box(users.flush_now().unwrap())
            })
        });
    }
    group.finish();
}

fn bench_reload(c: &mut Criterion) {
    let mut group = c.benchmark_group("entities/reload");
    group.sample_size(10);

    for &count in RECORD_COUNTS {
        let dir = TempDir::new().unwrap();
        {
            let users: Entities<User> = Entities::open(dir.path(), bench_config()).unwrap();
            users.add_many((0..count).map(user));
            users.close().unwrap();
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let users: Entities<User> = Entities::open(dir.path(), bench_config()).unwrap();
                black_box(users.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_crud, bench_queries, bench_flush, bench_reload);
criterion_main!(benches);
