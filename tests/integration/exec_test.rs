//! Execution filter lifecycle tests.
//!
//! Covers ambient dialect restoration, exactly-once disposal on every exit
//! path, and disposal timing of lazy sequences.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use db_execfilter::ambient;
use db_execfilter::config::ExecConfig;
use db_execfilter::db::{
    DialectProvider, IsolationLevel, MockConnection, MockDialect, ResultSet, Transaction,
};
use db_execfilter::{ExecError, ExecFilter, Result};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

fn named(name: &str) -> Arc<dyn DialectProvider> {
    Arc::new(MockDialect::named(name))
}

fn dialect_name() -> Option<String> {
    ambient::current_dialect().map(|d| d.name().to_string())
}

#[test]
fn test_exec_restores_ambient_dialect() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_dialect(named("inner"));

    ambient::with_dialect_sync(named("outer"), || {
        let seen = filter.exec(&conn, |_| Ok(dialect_name())).unwrap();
        assert_eq!(seen.as_deref(), Some("inner"));
        assert_eq!(dialect_name().as_deref(), Some("outer"));

        let failed: Result<()> = filter.exec(&conn, |_| Err(ExecError::command("syntax error")));
        assert!(failed.is_err());
        assert_eq!(dialect_name().as_deref(), Some("outer"));
    });

    assert!(dialect_name().is_none());
    assert_eq!(conn.commands_created(), 2);
    assert_eq!(conn.commands_disposed(), 2);
}

#[test]
fn test_exec_disposes_on_panic() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        filter.exec(&conn, |cmd| -> Result<()> {
            cmd.set_text("SELECT broken");
            panic!("work failed")
        })
    }));

    assert!(result.is_err());
    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(filter.last_command_text().as_deref(), Some("SELECT broken"));
    assert!(dialect_name().is_none());
}

#[test]
fn test_exec_void_disposes_once() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    for _ in 0..3 {
        filter
            .exec_void(&conn, |cmd| {
                cmd.set_text("VACUUM");
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(conn.commands_created(), 3);
    assert_eq!(conn.commands_disposed(), 3);
}

#[test]
fn test_nested_exec_on_different_connections() {
    let filter = ExecFilter::default();
    let outer = MockConnection::new().with_dialect(named("postgres"));
    let inner = MockConnection::new().with_dialect(named("sqlite"));

    let seen = filter
        .exec(&outer, |_| {
            let nested = filter.exec(&inner, |_| Ok(dialect_name()))?;
            Ok((nested, dialect_name()))
        })
        .unwrap();

    assert_eq!(seen.0.as_deref(), Some("sqlite"));
    assert_eq!(seen.1.as_deref(), Some("postgres"));
    assert_eq!(outer.commands_disposed(), 1);
    assert_eq!(inner.commands_disposed(), 1);
}

#[test]
fn test_creation_failure_propagates() {
    let filter = ExecFilter::default();
    let conn = MockConnection::unusable("server closed the connection");

    let result = filter.exec(&conn, |_| Ok(()));
    assert!(matches!(result, Err(ExecError::Connection(_))));
    assert_eq!(conn.commands_disposed(), 0);
}

#[test]
fn test_configured_timeout_and_ambient_transaction() {
    let filter = ExecFilter::new(ExecConfig {
        command_timeout_secs: Some(3),
        log_sql: false,
    });
    let conn = MockConnection::new();
    let tx = Transaction::new(IsolationLevel::RepeatableRead);

    let (timeout, transaction) = ambient::with_transaction_sync(tx.clone(), || {
        filter
            .exec(&conn, |cmd| Ok((cmd.timeout(), cmd.transaction().cloned())))
            .unwrap()
    });

    assert_eq!(timeout, Some(Duration::from_secs(3)));
    assert_eq!(transaction, Some(tx));
}

#[tokio::test]
async fn test_exec_async_restores_ambient_dialect() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_dialect(named("inner"));

    ambient::with_dialect(named("outer"), async {
        let seen = filter
            .exec_async(&conn, |_| {
                Box::pin(async {
                    tokio::task::yield_now().await;
                    Ok::<_, ExecError>(dialect_name())
                })
            })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some("inner"));
        assert_eq!(dialect_name().as_deref(), Some("outer"));
    })
    .await;

    assert!(dialect_name().is_none());
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_concurrent_exec_async_keeps_dialects_apart() {
    let filter = ExecFilter::default();
    let first = MockConnection::new()
        .with_dialect(named("first"))
        .with_latency(Duration::from_millis(20));
    let second = MockConnection::new()
        .with_dialect(named("second"))
        .with_latency(Duration::from_millis(5));

    let (a, b) = tokio::join!(
        filter.exec_async(&first, |cmd| Box::pin(async move {
            cmd.exec_non_query(&CancellationToken::new()).await?;
            Ok::<_, ExecError>(dialect_name())
        })),
        filter.exec_async(&second, |cmd| Box::pin(async move {
            cmd.exec_non_query(&CancellationToken::new()).await?;
            Ok::<_, ExecError>(dialect_name())
        })),
    );

    assert_eq!(a.unwrap().as_deref(), Some("first"));
    assert_eq!(b.unwrap().as_deref(), Some("second"));
    assert_eq!(first.commands_disposed(), 1);
    assert_eq!(second.commands_disposed(), 1);
}

#[tokio::test]
async fn test_exec_async_disposes_on_timeout() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_latency(Duration::from_millis(200));

    let result = filter
        .exec_async(&conn, |cmd| {
            Box::pin(async move {
                cmd.set_timeout(Some(Duration::from_millis(10)));
                cmd.exec_non_query_sql("SELECT pg_sleep(1)", None, &CancellationToken::new())
                    .await
            })
        })
        .await;

    assert!(matches!(result, Err(ExecError::Timeout(_))));
    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(filter.last_command_text().as_deref(), Some("SELECT pg_sleep(1)"));
}

#[tokio::test]
async fn test_exec_async_cancelled_before_issue() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_scalar(1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = filter
        .exec_async(&conn, move |cmd| {
            Box::pin(async move { cmd.scalar_value(Some("SELECT 1"), &cancel).await })
        })
        .await;

    assert!(matches!(result, Err(ExecError::Cancelled)));
    assert_eq!(conn.driver_calls(), 0);
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_exec_async_cancelled_in_flight() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_latency(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let result = filter
        .exec_async(&conn, move |cmd| {
            Box::pin(async move { cmd.long_scalar(Some("SELECT count(*) FROM events"), &cancel).await })
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(conn.driver_calls(), 1);
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_exec_async_disposes_when_dropped() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_latency(Duration::from_secs(5));

    let work = filter.exec_async(&conn, |cmd| {
        Box::pin(async move {
            cmd.set_text("SELECT pg_sleep(5)");
            cmd.exec_non_query(&CancellationToken::new()).await
        })
    });
    let outcome = tokio::time::timeout(Duration::from_millis(20), work).await;

    assert!(outcome.is_err());
    assert_eq!(conn.commands_created(), 1);
    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(filter.last_command_text().as_deref(), Some("SELECT pg_sleep(5)"));
    assert!(dialect_name().is_none());
}

#[tokio::test]
async fn test_exec_async_void() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_rows_affected(4);

    filter
        .exec_async_void(&conn, |cmd| {
            Box::pin(async move {
                let rows = cmd
                    .exec_non_query_sql("DELETE FROM sessions", None, &CancellationToken::new())
                    .await?;
                assert_eq!(rows, 4);
                Ok::<(), ExecError>(())
            })
        })
        .await
        .unwrap();

    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(filter.last_command_text().as_deref(), Some("DELETE FROM sessions"));
}

#[test]
fn test_exec_lazy_abandoned_after_three_of_ten() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    let mut rows = filter
        .exec_lazy(&conn, |cmd| {
            cmd.set_text("SELECT n FROM generate_series(1, 10) n");
            Ok(1..=10)
        })
        .unwrap();

    assert_eq!(rows.next(), Some(1));
    assert_eq!(rows.next(), Some(2));
    assert_eq!(rows.next(), Some(3));
    assert_eq!(conn.commands_disposed(), 0);
    assert_eq!(filter.last_command_text(), None);

    drop(rows);
    assert_eq!(conn.commands_disposed(), 1);
    assert_eq!(
        filter.last_command_text().as_deref(),
        Some("SELECT n FROM generate_series(1, 10) n")
    );
}

#[test]
fn test_exec_lazy_zero_pulls_still_disposes() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    let rows = filter.exec_lazy(&conn, |_| Ok(vec!["a", "b"])).unwrap();
    assert_eq!(conn.commands_disposed(), 0);
    drop(rows);
    assert_eq!(conn.commands_disposed(), 1);
}

#[test]
fn test_exec_lazy_over_live_reader() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(ResultSet::single_column("n", 1..=10i64));

    let rows = filter
        .exec_lazy(&conn, |cmd| {
            tokio_test::block_on(cmd.column::<i64>(Some("SELECT n FROM t"), &CancellationToken::new()))
        })
        .unwrap();

    let total: i64 = rows.sum();
    assert_eq!(total, 55);
    assert_eq!(conn.driver_calls(), 1);
    assert_eq!(conn.commands_disposed(), 1);
}

#[test]
fn test_exec_lazy_work_failure_disposes() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    let result = filter.exec_lazy(&conn, |_| Err::<Vec<i64>, _>(ExecError::command("bad cursor")));
    assert!(result.is_err());
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_exec_stream_abandoned_early() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new().with_result_set(ResultSet::single_column("n", 1..=10i64));

    let stream = filter
        .exec_stream(&conn, |cmd| {
            Box::pin(async move {
                let values = cmd
                    .column::<i64>(Some("SELECT n FROM t"), &CancellationToken::new())
                    .await?;
                let items = futures::stream::iter(values.into_iter().map(Ok::<i64, ExecError>));
                Ok::<_, ExecError>(items.boxed())
            })
        })
        .await
        .unwrap();

    let first: Vec<i64> = stream
        .take(3)
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(first, vec![1, 2, 3]);
    assert_eq!(conn.commands_disposed(), 1);
}

#[tokio::test]
async fn test_exec_stream_exhausted() {
    let filter = ExecFilter::default();
    let conn = MockConnection::new();

    let mut stream = filter
        .exec_stream(&conn, |_| {
            Box::pin(async {
                let items = futures::stream::iter(vec![Ok::<_, ExecError>("x"), Ok("y")]);
                Ok::<_, ExecError>(items.boxed())
            })
        })
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), "x");
    assert_eq!(stream.next().await.unwrap().unwrap(), "y");
    assert!(stream.next().await.is_none());
    assert!(stream.is_disposed());
    assert_eq!(conn.commands_disposed(), 1);
}
