//! Leaked statement tracking.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use sqlpool_interceptor::{InterceptorChain, InterceptorFactory, LeakedStatementTracker};
use sqlpool_testing::Fixture;

fn tracked() -> Fixture {
    Fixture::new(
        InterceptorChain::builder()
            .link(LeakedStatementTracker::new())
            .build(),
    )
}

fn tracker(fx: &Fixture) -> &LeakedStatementTracker {
    fx.conn.handler::<LeakedStatementTracker>().unwrap()
}

#[test]
fn test_connection_close_closes_leaked_statements() {
    let fx = tracked();

    let a = fx.conn.prepare_statement("select a").unwrap();
    let b = fx.conn.prepare_call("{call b()}").unwrap();
    let c = fx.conn.create_statement().unwrap();
    c.close().unwrap();
    assert_eq!(tracker(&fx).tracked_count(), 2);

    fx.conn.close().unwrap();

    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(fx.driver.native_closes(), 3);
    assert_eq!(fx.driver.open_statements(), 0);
    assert_eq!(tracker(&fx).tracked_count(), 0);
    assert_eq!(fx.pool.returns(), 1);
}

#[test]
fn test_closed_statements_are_unregistered() {
    let fx = tracked();
    for sql in ["a", "b", "c"] {
        fx.conn.prepare_statement(sql).unwrap().close().unwrap();
    }
    assert_eq!(tracker(&fx).tracked_count(), 0);

    fx.conn.close().unwrap();
    assert_eq!(fx.driver.native_closes(), 3);
}

#[test]
fn test_dropped_statements_are_not_kept_alive() {
    let fx = tracked();

    drop(fx.conn.prepare_statement("select 1").unwrap());
    assert_eq!(fx.driver.native_closes(), 1);
    assert_eq!(tracker(&fx).tracked_count(), 0);

    fx.conn.close().unwrap();
    assert_eq!(fx.driver.native_closes(), 1);
}

#[test]
fn test_checkin_and_disconnect_clear_registry() {
    let fx = tracked();

    let kept = fx.conn.prepare_statement("select 1").unwrap();
    fx.checkin();
    assert_eq!(tracker(&fx).tracked_count(), 0);

    fx.checkout();
    let other = fx.conn.prepare_statement("select 2").unwrap();
    assert_eq!(tracker(&fx).tracked_count(), 1);

    fx.discard();
    assert_eq!(tracker(&fx).tracked_count(), 0);
    assert!(!kept.is_closed());
    assert!(!other.is_closed());
}

#[test]
fn test_statement_finalizer_alias() {
    let conn = InterceptorFactory::new()
        .build_chain_from_str("StatementFinalizer")
        .unwrap();
    let fx = Fixture::new(conn);

    let stmt = fx.conn.prepare_statement("select 1").unwrap();
    fx.conn.close().unwrap();

    assert!(stmt.is_closed());
    assert_eq!(fx.driver.native_closes(), 1);
}
