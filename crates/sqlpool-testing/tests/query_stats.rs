//! Slow query recording.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sqlpool_interceptor::{
    Connection, InterceptorChain, QueryStatsConfig, QueryStatsRecorder, QueryStatsRegistry,
};
use sqlpool_testing::{Fixture, MockDriver, MockPool, init_tracing};

fn recorded(config: QueryStatsConfig) -> (Fixture, Arc<QueryStatsRegistry>) {
    let registry = QueryStatsRegistry::new();
    let conn = InterceptorChain::builder()
        .link(QueryStatsRecorder::new(config, Arc::clone(&registry)))
        .build();
    (Fixture::new(conn), registry)
}

#[test]
fn test_only_slow_executions_are_recorded() {
    init_tracing();
    let (fx, registry) = recorded(QueryStatsConfig::default());
    fx.driver.set_latency("select slow", Duration::from_millis(150));

    let fast = fx.conn.prepare_statement("select 1").unwrap();
    fast.execute_query().unwrap();
    let table = registry.table(fx.pool.id()).unwrap();
    assert!(table.get("select 1").is_none());
    assert!(table.is_empty());

    let slow = fx.conn.prepare_statement("select slow").unwrap();
    slow.execute_query().unwrap();

    let stats = table.get("select slow").unwrap();
    assert_eq!(stats.count, 1);
    assert!(stats.max_ms >= 150);
    assert_eq!(stats.min_ms, stats.max_ms);
    assert!(stats.max_at.is_some());
}

#[test]
fn test_record_everything() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    for _ in 0..3 {
        stmt.execute_query().unwrap();
    }
    stmt.execute_update().unwrap();

    let snapshot = registry.snapshot(fx.pool.id()).unwrap();
    let stats = &snapshot["select 1"];
    assert_eq!(stats.count, 4);
    assert!(stats.min_ms <= stats.max_ms);
    assert!(stats.total_ms >= stats.max_ms);
}

#[test]
fn test_plain_statements_keyed_by_executed_sql() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());

    let stmt = fx.conn.create_statement().unwrap();
    stmt.execute_update_sql("update t set x = 1").unwrap();
    stmt.execute_sql("select 2").unwrap();

    stmt.add_batch_sql("insert into t values (1)").unwrap();
    stmt.add_batch_sql("insert into t values (2)").unwrap();
    assert_eq!(stmt.execute_batch().unwrap(), vec![1, 1]);

    let table = registry.table(fx.pool.id()).unwrap();
    let keys: Vec<_> = table.snapshot().into_iter().map(|s| s.sql).collect();
    assert_eq!(keys, vec!["update t set x = 1", "select 2", "batch"]);
}

#[test]
fn test_prepared_batch_keyed_by_prepared_sql() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());

    let stmt = fx.conn.prepare_statement("insert into t values (?)").unwrap();
    stmt.bind(1, 7_i64).unwrap();
    stmt.add_batch().unwrap();
    stmt.execute_batch().unwrap();

    let table = registry.table(fx.pool.id()).unwrap();
    assert_eq!(table.get("insert into t values (?)").unwrap().count, 1);
    assert!(table.get("batch").is_none());
}

#[test]
fn test_failed_executions_are_not_recorded() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());
    fx.driver.fail_execution("select 1", "40001", "deadlock");

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    assert!(stmt.execute_query().is_err());
    assert!(stmt.bind(1, "x").is_ok());

    assert!(registry.table(fx.pool.id()).unwrap().is_empty());
}

#[test]
fn test_table_bounded_by_max_queries() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all().max_queries(2));

    let stmt = fx.conn.create_statement().unwrap();
    for sql in ["select 1", "select 2", "select 3"] {
        stmt.execute_sql(sql).unwrap();
    }

    let table = registry.table(fx.pool.id()).unwrap();
    assert_eq!(table.len(), 2);
    assert!(table.get("select 1").is_none());
}

#[test]
fn test_pool_close_drops_table() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());
    fx.conn.prepare_statement("select 1").unwrap().execute().unwrap();
    assert_eq!(fx.pool.listener_count(), 1);

    fx.pool.close(&[&fx.conn]);

    assert!(registry.table(fx.pool.id()).is_none());
    assert!(registry.pools().is_empty());
    let recorder = fx.conn.handler::<QueryStatsRecorder>().unwrap();
    assert!(recorder.table().is_none());
}

#[test]
fn test_table_attached_at_checkout() {
    let registry = QueryStatsRegistry::new();
    let conn = InterceptorChain::builder()
        .link(QueryStatsRecorder::new(
            QueryStatsConfig::new().record_all(),
            Arc::clone(&registry),
        ))
        .build();
    let driver = MockDriver::new();
    let pooled = driver.pooled();

    let recorder = conn.handler::<QueryStatsRecorder>().unwrap();
    assert!(recorder.table().is_none());

    conn.initialize(&MockPool::new().handle(), &pooled);
    assert!(recorder.table().is_some());
    assert_eq!(registry.pools().len(), 1);
}

#[test]
fn test_connections_of_one_pool_share_a_table() {
    let registry = QueryStatsRegistry::new();
    let driver = MockDriver::new();
    let pool = MockPool::new();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let pool = pool.handle();
            let pooled = driver.pooled();
            thread::spawn(move || {
                let conn: Connection = InterceptorChain::builder()
                    .link(QueryStatsRecorder::new(
                        QueryStatsConfig::new().record_all(),
                        registry,
                    ))
                    .build();
                conn.initialize(&pool, &pooled);

                let stmt = conn.prepare_statement("select 1").unwrap();
                for _ in 0..50 {
                    stmt.execute_query().unwrap();
                }
                stmt.close().unwrap();
                conn.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = registry.snapshot(pool.id()).unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["select 1"].count, 200);
    assert_eq!(pool.listener_count(), 1);
    assert_eq!(pool.returns(), 4);
}

#[test]
fn test_snapshot_report_forms() {
    let (fx, registry) = recorded(QueryStatsConfig::new().record_all());
    fx.conn.prepare_statement("select 1").unwrap().execute().unwrap();

    let stats = registry.table(fx.pool.id()).unwrap().get("select 1").unwrap();
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["sql"], "select 1");
    assert_eq!(json["count"], 1);
    assert!(json["max_at"].is_string());

    let report = stats.to_string();
    assert!(report.starts_with("QueryStats[query: select 1, count: 1,"));
}
