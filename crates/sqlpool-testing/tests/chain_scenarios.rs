//! Whole-chain scenarios combining several interceptors.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use sqlpool_interceptor::{
    InterceptorChain, InterceptorFactory, LeakedStatementTracker, QueryStatsConfig,
    QueryStatsRecorder, QueryStatsRegistry, Statement, StatementCache, StatementCacheConfig,
    StatementDecorator,
};
use sqlpool_testing::{Fixture, StatementCounter, init_tracing};

#[test]
fn test_connection_close_closes_statement_below_cache() {
    init_tracing();
    let registry = QueryStatsRegistry::new();
    let fx = Fixture::new(
        InterceptorChain::builder()
            .link(QueryStatsRecorder::new(QueryStatsConfig::default(), Arc::clone(&registry)))
            .link(StatementCache::default())
            .link(LeakedStatementTracker::new())
            .build(),
    );

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    stmt.execute_query().unwrap();

    fx.conn.close().unwrap();
    assert_eq!(fx.driver.native_closes(), 1);
    assert!(stmt.is_closed());

    // The caller's late close finds nothing left to park.
    stmt.close().unwrap();
    let cache = fx.conn.handler::<StatementCache>().unwrap();
    assert_eq!(cache.cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 1);
    assert_eq!(fx.driver.open_statements(), 0);
}

#[test]
fn test_tracker_above_cache_leaves_parked_statements() {
    let fx = Fixture::new(
        InterceptorFactory::new()
            .build_chain_from_str(
                "QueryStatsRecorder(threshold=100);LeakedStatementTracker;StatementCache(max=10)",
            )
            .unwrap(),
    );

    let parked = fx.conn.prepare_statement("select 1").unwrap();
    parked.close().unwrap();
    let leaked = fx.conn.prepare_statement("select 2").unwrap();

    fx.conn.close().unwrap();

    assert!(leaked.is_closed());
    let cache = fx.conn.handler::<StatementCache>().unwrap();
    assert_eq!(cache.cached_sql(), vec!["select 2", "select 1"]);
    assert_eq!(fx.driver.native_closes(), 0);

    fx.discard();
    assert_eq!(fx.driver.native_closes(), 2);
    assert_eq!(fx.driver.open_statements(), 0);
}

#[test]
fn test_counter_over_bounded_cache() {
    let fx = Fixture::new(
        InterceptorChain::builder()
            .link(StatementCounter::new())
            .link(StatementCache::new(StatementCacheConfig::new().max(40)))
            .build(),
    );

    for i in 0..120 {
        let stmt = fx.conn.prepare_statement(&format!("select {i}")).unwrap();
        stmt.execute_query().unwrap();
        stmt.close().unwrap();
    }

    let counter = fx.conn.handler::<StatementCounter>().unwrap();
    assert_eq!(counter.created(), 120);
    assert_eq!(counter.closed(), 120);
    assert_eq!(counter.open(), 0);

    let cache = fx.conn.handler::<StatementCache>().unwrap();
    assert_eq!(cache.cache_size(), 40);
    assert_eq!(fx.driver.prepares(), 120);
    assert_eq!(fx.driver.native_closes(), 80);
    assert_eq!(fx.driver.open_statements(), 40);
}

#[test]
fn test_counter_sees_open_statements() {
    let fx = Fixture::new(
        InterceptorChain::builder()
            .link(StatementCounter::new())
            .build(),
    );

    let a = fx.conn.prepare_statement("a").unwrap();
    let _b = fx.conn.create_statement().unwrap();
    a.close().unwrap();

    let counter = fx.conn.handler::<StatementCounter>().unwrap();
    assert_eq!(counter.open(), 1);
}

#[test]
fn test_result_set_reports_outermost_statement() {
    let fx = Fixture::new(
        InterceptorChain::builder()
            .link(StatementDecorator::new())
            .link(StatementCache::default())
            .link(LeakedStatementTracker::new())
            .build(),
    );

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    let rs = stmt.execute_query().unwrap();
    assert!(Statement::ptr_eq(rs.statement().unwrap(), &stmt));
}

#[test]
fn test_slow_cached_statement_recorded_across_reuse() {
    let factory = InterceptorFactory::new();
    let fx = Fixture::new(
        factory
            .build_chain_from_str("SlowQueryReport(threshold=50);StatementCache")
            .unwrap(),
    );
    fx.driver.set_latency("select slow", Duration::from_millis(80));

    for _ in 0..2 {
        let stmt = fx.conn.prepare_statement("select slow").unwrap();
        stmt.execute_query().unwrap();
        stmt.close().unwrap();
    }

    assert_eq!(fx.driver.prepares(), 1);
    let snapshot = factory.stats_registry().snapshot(fx.pool.id()).unwrap();
    assert_eq!(snapshot["select slow"].count, 2);
}

#[test]
fn test_permanent_failure_through_full_chain() {
    let fx = Fixture::new(
        InterceptorFactory::new()
            .build_chain_from_str("QueryStatsRecorder;StatementCache;LeakedStatementTracker")
            .unwrap(),
    );
    fx.driver.fail_permanently("select broken");

    let stmt = fx.conn.prepare_statement("select broken").unwrap();
    let err = stmt.execute_query().unwrap_err();
    assert!(err.is_permanent_statement_failure());
    stmt.close().unwrap();

    let cache = fx.conn.handler::<StatementCache>().unwrap();
    assert_eq!(cache.cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 1);
}

#[test]
fn test_handler_lookup() {
    let conn = InterceptorFactory::new()
        .build_chain_from_str("StatementCache(max=3)")
        .unwrap();

    assert!(conn.handler::<StatementCache>().is_some());
    assert!(conn.handler::<LeakedStatementTracker>().is_none());
    assert_eq!(conn.chain().len(), 2);
}
