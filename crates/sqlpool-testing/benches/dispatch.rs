//! Benchmarks for dispatch overhead through the interceptor chain.

#![allow(missing_docs, clippy::unwrap_used)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use sqlpool_interceptor::{
    Connection, InterceptorChain, LeakedStatementTracker, QueryStatsConfig, QueryStatsRecorder,
    QueryStatsRegistry, StatementCache,
};
use sqlpool_testing::Fixture;

fn full_chain() -> Connection {
    InterceptorChain::builder()
        .link(QueryStatsRecorder::new(
            QueryStatsConfig::default(),
            QueryStatsRegistry::new(),
        ))
        .link(LeakedStatementTracker::new())
        .link(StatementCache::default())
        .build()
}

fn bench_prepare_execute_close(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_execute_close");

    let bare = Fixture::new(InterceptorChain::builder().build());
    group.bench_function("terminal_only", |b| {
        b.iter(|| {
            let stmt = bare.conn.prepare_statement(black_box("select 1")).unwrap();
            black_box(stmt.execute_query().unwrap());
            stmt.close().unwrap();
        });
    });

    let full = Fixture::new(full_chain());
    group.bench_function("full_chain_cached", |b| {
        b.iter(|| {
            let stmt = full.conn.prepare_statement(black_box("select 1")).unwrap();
            black_box(stmt.execute_query().unwrap());
            stmt.close().unwrap();
        });
    });

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");

    let bare = Fixture::new(InterceptorChain::builder().build());
    let bare_stmt = bare.conn.prepare_statement("select 1").unwrap();
    group.bench_function("terminal_only", |b| {
        b.iter(|| black_box(bare_stmt.execute_update().unwrap()));
    });

    let full = Fixture::new(full_chain());
    let full_stmt = full.conn.prepare_statement("select 1").unwrap();
    group.bench_function("full_chain", |b| {
        b.iter(|| black_box(full_stmt.execute_update().unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_prepare_execute_close, bench_execute);
criterion_main!(benches);
