//! Statement cache behavior against the mock driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Barrier;
use std::thread;

use sqlpool_interceptor::{
    Error, InterceptorChain, LeakedStatementTracker, Resource, Statement, StatementCache,
    StatementCacheConfig,
};
use sqlpool_testing::{Fixture, MockDriver};

fn cached(config: StatementCacheConfig) -> Fixture {
    Fixture::new(
        InterceptorChain::builder()
            .link(StatementCache::new(config))
            .build(),
    )
}

fn cache(fx: &Fixture) -> &StatementCache {
    fx.conn.handler::<StatementCache>().unwrap()
}

fn prepare_and_close(fx: &Fixture, sql: &str) {
    let stmt = fx.conn.prepare_statement(sql).unwrap();
    stmt.execute_query().unwrap();
    stmt.close().unwrap();
}

#[test]
fn test_repeated_prepare_reuses_native_statement() {
    let fx = cached(StatementCacheConfig::default());

    prepare_and_close(&fx, "select 1");
    assert_eq!(cache(&fx).cache_size(), 1);
    assert_eq!(fx.driver.prepares(), 1);
    assert_eq!(fx.driver.native_closes(), 0);

    prepare_and_close(&fx, "select 1");
    assert_eq!(fx.driver.prepares(), 1);
    assert_eq!(cache(&fx).cache_size(), 1);

    prepare_and_close(&fx, "select 2");
    assert_eq!(fx.driver.prepares(), 2);
    assert_eq!(cache(&fx).cache_size(), 2);
    assert_eq!(fx.driver.executions(), 3);
}

#[test]
fn test_closed_handle_stays_closed_after_parking() {
    let fx = cached(StatementCacheConfig::default());

    let first = fx.conn.prepare_statement("select 1").unwrap();
    first.close().unwrap();
    assert!(first.is_closed());
    assert!(matches!(
        first.execute_query(),
        Err(Error::ResourceClosed(Resource::Statement))
    ));

    let second = fx.conn.prepare_statement("select 1").unwrap();
    assert!(!Statement::ptr_eq(&first, &second));
    assert!(!second.is_closed());
    assert!(second.execute_query().is_ok());
    assert!(first.is_closed());
}

#[test]
fn test_close_twice_is_noop() {
    let fx = cached(StatementCacheConfig::default());

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    stmt.close().unwrap();
    stmt.close().unwrap();

    assert_eq!(cache(&fx).cache_size(), 1);
    assert_eq!(fx.driver.native_closes(), 0);
}

#[test]
fn test_lru_eviction_closes_least_recent() {
    let fx = cached(StatementCacheConfig::new().max(2));

    prepare_and_close(&fx, "a");
    prepare_and_close(&fx, "b");
    prepare_and_close(&fx, "a");
    assert_eq!(cache(&fx).cached_sql(), vec!["a", "b"]);

    prepare_and_close(&fx, "c");
    assert_eq!(cache(&fx).cache_size(), 2);
    assert_eq!(cache(&fx).cached_sql(), vec!["c", "a"]);
    assert_eq!(fx.driver.native_closes(), 1);
    assert_eq!(fx.driver.open_statements(), 2);
}

#[test]
fn test_single_slot_cache() {
    let fx = cached(StatementCacheConfig::new().max(1));

    prepare_and_close(&fx, "A");
    assert_eq!(cache(&fx).cached_sql(), vec!["A"]);

    prepare_and_close(&fx, "B");
    assert_eq!(cache(&fx).cached_sql(), vec!["B"]);
    assert_eq!(fx.driver.native_closes(), 1);

    prepare_and_close(&fx, "A");
    assert_eq!(fx.driver.prepared_sql(), vec!["A", "B", "A"]);
    assert_eq!(cache(&fx).cached_sql(), vec!["A"]);
    assert_eq!(fx.driver.native_closes(), 2);
}

#[test]
fn test_permanent_failure_is_never_cached() {
    let fx = cached(StatementCacheConfig::default());
    fx.driver.fail_permanently("select broken");

    let stmt = fx.conn.prepare_statement("select broken").unwrap();
    let err = stmt.execute_query().unwrap_err();
    let driver_err = err.driver_error().expect("driver error");
    assert_eq!(driver_err.sql_state(), Some("0A000"));

    stmt.close().unwrap();
    assert_eq!(cache(&fx).cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 1);

    fx.driver.clear_failures();
    prepare_and_close(&fx, "select broken");
    assert_eq!(fx.driver.prepares(), 2);
}

#[test]
fn test_ordinary_failure_keeps_statement_cacheable() {
    let fx = cached(StatementCacheConfig::default());
    fx.driver.fail_execution("select x", "42000", "syntax error");

    let stmt = fx.conn.prepare_statement("select x").unwrap();
    assert!(stmt.execute_query().is_err());
    stmt.close().unwrap();

    assert_eq!(cache(&fx).cache_size(), 1);
    assert_eq!(fx.driver.native_closes(), 0);
}

#[test]
fn test_disconnect_empties_cache() {
    let fx = cached(StatementCacheConfig::default());
    for sql in ["a", "b", "c"] {
        prepare_and_close(&fx, sql);
    }
    assert_eq!(cache(&fx).cache_size(), 3);

    fx.discard();

    assert_eq!(cache(&fx).cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 3);
    assert_eq!(fx.driver.open_statements(), 0);
    assert_eq!(fx.driver.connection_closes(), 1);
}

#[test]
fn test_plain_statements_bypass_cache() {
    let fx = cached(StatementCacheConfig::default());

    let stmt = fx.conn.create_statement().unwrap();
    stmt.execute_sql("select 1").unwrap();
    stmt.close().unwrap();

    assert_eq!(cache(&fx).cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 1);
}

#[test]
fn test_callable_statements_follow_config() {
    let fx = cached(StatementCacheConfig::default());
    fx.conn.prepare_call("{call p()}").unwrap().close().unwrap();
    assert_eq!(cache(&fx).cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 1);

    let fx = cached(StatementCacheConfig::new().callable(true));
    fx.conn.prepare_call("{call p()}").unwrap().close().unwrap();
    fx.conn.prepare_call("{call p()}").unwrap().close().unwrap();
    assert_eq!(cache(&fx).cache_size(), 1);
    assert_eq!(fx.driver.prepares(), 1);
}

#[test]
fn test_kind_mismatch_is_a_miss() {
    let fx = cached(StatementCacheConfig::new().callable(true));

    fx.conn.prepare_statement("x").unwrap().close().unwrap();
    let call = fx.conn.prepare_call("x").unwrap();
    assert_eq!(fx.driver.prepares(), 2);

    // The prepared entry already holds the key, so the call is closed.
    call.close().unwrap();
    assert_eq!(cache(&fx).cache_size(), 1);
    assert_eq!(fx.driver.native_closes(), 1);
}

#[test]
fn test_disabled_cache_closes_everything() {
    let fx = cached(StatementCacheConfig::new().max(0));
    prepare_and_close(&fx, "select 1");
    prepare_and_close(&fx, "select 1");

    assert!(!cache(&fx).is_enabled());
    assert_eq!(fx.driver.prepares(), 2);
    assert_eq!(fx.driver.native_closes(), 2);
}

#[test]
fn test_cache_survives_checkin() {
    let fx = cached(StatementCacheConfig::default());
    prepare_and_close(&fx, "select 1");

    fx.conn.close().unwrap();
    assert_eq!(fx.pool.returns(), 1);
    fx.checkin();
    fx.checkout();

    prepare_and_close(&fx, "select 1");
    assert_eq!(fx.driver.prepares(), 1);
}

#[test]
fn test_hit_on_closed_connection_fails() {
    let fx = cached(StatementCacheConfig::default());
    prepare_and_close(&fx, "select 1");
    fx.conn.close().unwrap();

    assert!(matches!(
        fx.conn.prepare_statement("select 1"),
        Err(Error::ResourceClosed(Resource::Connection))
    ));
    assert_eq!(cache(&fx).cache_size(), 1);
}

#[test]
fn test_force_close() {
    let fx = cached(StatementCacheConfig::default());
    prepare_and_close(&fx, "select 1");

    assert!(cache(&fx).force_close("select 1"));
    assert!(!cache(&fx).force_close("select 1"));
    assert_eq!(fx.driver.native_closes(), 1);
}

#[test]
fn test_stale_entry_is_discarded_on_lookup() {
    // The tracker sits below the cache and closes parked statements along
    // with the leaked ones.
    let fx = Fixture::new(
        InterceptorChain::builder()
            .link(StatementCache::default())
            .link(LeakedStatementTracker::new())
            .build(),
    );

    prepare_and_close(&fx, "select 1");
    fx.conn.close().unwrap();
    assert_eq!(fx.driver.native_closes(), 1);

    fx.checkin();
    fx.checkout();

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    assert_eq!(fx.driver.prepares(), 2);
    assert_eq!(cache(&fx).cache_size(), 0);
    assert!(stmt.execute_query().is_ok());
}

#[test]
fn test_result_set_reports_caller_statement() {
    let fx = cached(StatementCacheConfig::default());
    let stmt = fx.conn.prepare_statement("select 1").unwrap();

    let rs = stmt.execute_query().unwrap();
    assert!(Statement::ptr_eq(rs.statement().unwrap(), &stmt));
    assert_eq!(rs.rows().len(), 1);

    let owner = stmt.connection().unwrap();
    assert!(sqlpool_interceptor::Connection::ptr_eq(&owner, &fx.conn));
}

#[test]
fn test_caches_are_per_connection() {
    let driver = MockDriver::new();
    let build = || {
        InterceptorChain::builder()
            .link(StatementCache::default())
            .build()
    };
    let first = Fixture::with_driver(driver.clone(), build());
    let second = Fixture::with_driver(driver.clone(), build());

    prepare_and_close(&first, "select 1");
    prepare_and_close(&second, "select 1");

    assert_eq!(driver.prepares(), 2);
    assert_eq!(cache(&first).cache_size(), 1);
    assert_eq!(cache(&second).cache_size(), 1);
}

#[test]
fn test_statement_outliving_discard_is_closed_not_parked() {
    let fx = cached(StatementCacheConfig::default());
    let live = fx.conn.prepare_statement("select 1").unwrap();
    prepare_and_close(&fx, "select 2");

    fx.discard();
    assert_eq!(cache(&fx).cache_size(), 0);

    live.close().unwrap();
    assert_eq!(cache(&fx).cache_size(), 0);
    assert_eq!(fx.driver.native_closes(), 2);
    assert_eq!(fx.driver.open_statements(), 0);

    // The chain is reused on another physical connection.
    fx.conn.initialize(&fx.pool.handle(), &fx.driver.pooled());
    prepare_and_close(&fx, "select 1");
    assert_eq!(fx.driver.prepares(), 3);
    assert_eq!(cache(&fx).cached_sql(), vec!["select 1"]);
}

#[test]
fn test_concurrent_close_parks_once() {
    const THREADS: usize = 8;

    for _ in 0..50 {
        let fx = cached(StatementCacheConfig::default());
        let stmt = fx.conn.prepare_statement("select 1").unwrap();
        let barrier = Barrier::new(THREADS);

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    stmt.close().unwrap();
                });
            }
        });

        assert!(stmt.is_closed());
        assert_eq!(cache(&fx).cache_size(), 1);
        assert_eq!(fx.driver.native_closes(), 0);
        assert_eq!(fx.driver.open_statements(), 1);
    }
}
