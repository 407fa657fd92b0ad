//! Transaction state machine and release accounting against a scripted pool.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::try_stream;
use common::{Event, MockPool, command_error};
use db_context::db::{PooledContext, StatementName, TransactionCommand};
use db_context::error::{DbError, DbResult};
use db_context::models::{Record, TransactionState};
use db_context::params;
use futures_util::stream::{self, StreamExt, TryStreamExt};

fn context(pool: &MockPool) -> PooledContext<MockPool> {
    PooledContext::new(pool.clone())
}

#[tokio::test]
async fn test_completed_body_commits() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let records: Vec<Record> = ctx
        .transaction(|tx| Ok(tx.exec("INSERT INTO t(v) VALUES (1)")))
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records, vec![Record::Count(1)]);
    assert_eq!(
        pool.events(),
        vec![
            Event::Acquire,
            Event::Command(TransactionCommand::Begin),
            Event::Run {
                sql: "INSERT INTO t(v) VALUES (1)".to_string(),
                name: StatementName::for_sql("INSERT INTO t(v) VALUES (1)").to_string(),
            },
            Event::Command(TransactionCommand::Commit),
            Event::Release { error: None },
        ]
    );
}

#[tokio::test]
async fn test_statements_run_in_issue_order() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let records: Vec<Record> = ctx
        .transaction(|tx| {
            Ok(stream::iter(["INSERT INTO t VALUES (1)", "SELECT v FROM t", "DELETE FROM t"])
                .map(move |sql| tx.exec(sql))
                .flatten())
        })
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records.len(), 4);
    assert_eq!(records[0], Record::Count(1));
    assert!(records[1].as_row().is_some());
    assert!(records[2].as_row().is_some());
    assert_eq!(records[3], Record::Count(1));

    let sql: Vec<String> = pool
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Run { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(sql, vec!["INSERT INTO t VALUES (1)", "SELECT v FROM t", "DELETE FROM t"]);
}

#[tokio::test]
async fn test_commit_emits_value_and_terminates() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let results: Vec<DbResult<String>> = ctx
        .transaction(|tx| {
            Ok(try_stream! {
                assert_eq!(tx.state(), TransactionState::Active);
                tx.exec("INSERT INTO t VALUES (1)").try_collect::<Vec<_>>().await?;

                let committed: Vec<i32> = tx.commit(Some(42)).try_collect().await?;
                assert_eq!(committed, vec![42]);
                assert_eq!(tx.state(), TransactionState::Terminated);

                let err = tx.exec("SELECT 1").try_collect::<Vec<_>>().await.unwrap_err();
                assert!(matches!(err, DbError::TerminatedTransaction { .. }));
                let err = tx
                    .prepare("SELECT $1", params![1])
                    .try_collect::<Vec<_>>()
                    .await
                    .unwrap_err();
                assert!(matches!(err, DbError::TerminatedTransaction { .. }));

                // Later terminal calls are no-ops
                let late_commit = tx.commit(Some(1)).try_collect::<Vec<i32>>().await?;
                assert!(late_commit.is_empty());
                let late_rollback = tx.rollback(Some(1)).try_collect::<Vec<i32>>().await?;
                assert!(late_rollback.is_empty());
                tx.rollback_with_error(DbError::aborted("late"))
                    .try_collect::<Vec<()>>()
                    .await?;

                yield "body done".to_string();
            })
        })
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap(), "body done");
    assert_eq!(pool.commands(), vec![TransactionCommand::Begin, TransactionCommand::Commit]);
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_explicit_rollback_completes_without_commit() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let records: Vec<Record> = ctx
        .transaction(|tx| {
            Ok(try_stream! {
                tx.exec("INSERT INTO t VALUES (1)").try_collect::<Vec<_>>().await?;
                for await value in tx.rollback::<Record>(None) {
                    yield value?;
                }
            })
        })
        .try_collect()
        .await
        .unwrap();

    assert!(records.is_empty());
    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_rollback_emits_value() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let values: Vec<&str> = ctx
        .transaction(|tx| Ok(tx.rollback(Some("undone"))))
        .try_collect()
        .await
        .unwrap();

    assert_eq!(values, vec!["undone"]);
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_body_error_rolls_back_and_surfaces_error() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let results: Vec<DbResult<Record>> = ctx
        .transaction(|tx| {
            Ok(tx
                .exec("INSERT INTO t VALUES (1)")
                .chain(stream::once(async { Err(DbError::aborted("boom")) })))
        })
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &Record::Count(1));
    let err = results[1].as_ref().unwrap_err();
    assert!(matches!(err, DbError::Aborted { message } if message == "boom"));

    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    assert_eq!(
        pool.releases(),
        vec![Some("Transaction aborted: boom".to_string())]
    );
}

#[tokio::test]
async fn test_failed_statement_surfaces_through_body() {
    let pool = MockPool::new().fail_sql("missing");
    let ctx = context(&pool);

    let err = ctx
        .transaction(|tx| Ok(tx.exec("SELECT * FROM missing")))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "pgerror(42P01):relation does not exist");
    assert_eq!(pool.releases(), vec![Some(err.to_string())]);
}

#[tokio::test]
async fn test_failed_statement_leaves_transaction_open() {
    let pool = MockPool::new().fail_sql("missing");
    let ctx = context(&pool);

    let values: Vec<i32> = ctx
        .transaction(|tx| {
            Ok(try_stream! {
                let err = tx.exec("SELECT * FROM missing").try_collect::<Vec<_>>().await.unwrap_err();
                assert_eq!(err.code(), Some("42P01"));
                assert!(!tx.is_terminated());

                let records: Vec<Record> = tx.exec("SELECT v FROM t").try_collect().await?;
                yield records.len() as i32;
            })
        })
        .try_collect()
        .await
        .unwrap();

    assert_eq!(values, vec![2]);
    assert_eq!(pool.commands(), vec![TransactionCommand::Begin, TransactionCommand::Commit]);
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_body_error_with_failing_rollback_surfaces_rollback_error() {
    let pool = MockPool::new().fail_command(TransactionCommand::Rollback);
    let ctx = context(&pool);

    let err = ctx
        .transaction(|_tx| Ok(stream::once(async { Err::<Record, _>(DbError::aborted("boom")) })))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    let rollback_error = command_error(TransactionCommand::Rollback);
    assert!(matches!(err, DbError::DoubleRollback { .. }));
    assert_eq!(err.to_string(), rollback_error.to_string());
    let cause = std::error::Error::source(&err).unwrap();
    assert_eq!(cause.to_string(), "Transaction aborted: boom");

    assert_eq!(pool.releases(), vec![Some(err.to_string())]);
}

#[tokio::test]
async fn test_commit_failure_with_successful_rollback() {
    let pool = MockPool::new().fail_command(TransactionCommand::Commit);
    let ctx = context(&pool);

    let err = ctx
        .transaction(|tx| Ok(tx.exec("INSERT INTO t VALUES (1)")))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        command_error(TransactionCommand::Commit).to_string()
    );
    assert_eq!(
        pool.commands(),
        vec![
            TransactionCommand::Begin,
            TransactionCommand::Commit,
            TransactionCommand::Rollback
        ]
    );
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_commit_and_rollback_failure() {
    let pool = MockPool::new()
        .fail_command(TransactionCommand::Commit)
        .fail_command(TransactionCommand::Rollback);
    let ctx = context(&pool);

    let err = ctx
        .transaction(|tx| Ok(tx.exec("INSERT INTO t VALUES (1)")))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    let commit_error = command_error(TransactionCommand::Commit);
    assert!(matches!(err, DbError::CompensatingRollback { .. }));
    assert_eq!(err.code(), Some("25P01"));
    let source = std::error::Error::source(&err).unwrap();
    assert_eq!(source.to_string(), commit_error.to_string());

    assert_eq!(pool.releases(), vec![Some(commit_error.to_string())]);
}

#[tokio::test]
async fn test_explicit_rollback_failure() {
    let pool = MockPool::new().fail_command(TransactionCommand::Rollback);
    let ctx = context(&pool);

    let err = ctx
        .transaction(|tx| Ok(tx.rollback::<()>(None)))
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    let rollback_error = command_error(TransactionCommand::Rollback);
    assert_eq!(err.to_string(), rollback_error.to_string());
    assert_eq!(pool.releases(), vec![Some(rollback_error.to_string())]);
}

#[tokio::test]
async fn test_body_returning_err_rolls_back() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let results: Vec<DbResult<()>> = ctx
        .transaction(|_tx| Err::<stream::Empty<DbResult<()>>, _>(DbError::aborted("bad input")))
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    assert!(matches!(&results[0], Err(DbError::Aborted { message }) if message == "bad input"));
    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    assert_eq!(
        pool.releases(),
        vec![Some("Transaction aborted: bad input".to_string())]
    );
}

#[tokio::test]
async fn test_panicking_body_rolls_back() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let err = ctx
        .transaction(|_tx| -> DbResult<stream::Empty<DbResult<()>>> { panic!("exploded") })
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(matches!(&err, DbError::Aborted { message } if message == "exploded"));
    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    assert_eq!(pool.releases().len(), 1);
}

#[tokio::test]
async fn test_acquire_failure_never_invokes_body() {
    let pool = MockPool::new().fail_acquire();
    let ctx = context(&pool);
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = invoked.clone();
    let err = ctx
        .transaction(move |_tx| {
            flag.store(true, Ordering::SeqCst);
            Ok(stream::empty::<DbResult<()>>())
        })
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert!(err.is_connection_error());
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(pool.events().is_empty());
}

#[tokio::test]
async fn test_begin_failure_releases_and_never_invokes_body() {
    let pool = MockPool::new().fail_command(TransactionCommand::Begin);
    let ctx = context(&pool);
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = invoked.clone();
    let err = ctx
        .transaction(move |_tx| {
            flag.store(true, Ordering::SeqCst);
            Ok(stream::empty::<DbResult<()>>())
        })
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("08006"));
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(pool.releases(), vec![Some(err.to_string())]);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let mut stream = ctx.transaction(|tx| {
        Ok(tx
            .exec("INSERT INTO t VALUES (1)")
            .chain(stream::pending()))
    });
    assert_eq!(stream.next().await.unwrap().unwrap(), Record::Count(1));
    let pending = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
    assert!(pending.is_err());
    drop(stream);

    pool.wait_for_releases(1).await;
    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    let releases = pool.releases();
    assert_eq!(releases.len(), 1);
    assert!(releases[0].as_deref().unwrap().contains("dropped"));
}

#[tokio::test]
async fn test_transaction_dropped_during_begin_rolls_back() {
    let pool = MockPool::new().begin_delay(Duration::from_millis(50));
    let ctx = context(&pool);
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&invoked);
    let mut stream = ctx.transaction(move |tx| {
        flag.store(true, Ordering::SeqCst);
        Ok(tx.exec("INSERT INTO t VALUES (1)"))
    });
    let pending = tokio::time::timeout(Duration::from_millis(10), stream.next()).await;
    assert!(pending.is_err());
    drop(stream);

    pool.wait_for_releases(1).await;
    assert_eq!(pool.acquires(), 1);
    assert_eq!(
        pool.commands(),
        vec![TransactionCommand::Begin, TransactionCommand::Rollback]
    );
    let releases = pool.releases();
    assert_eq!(releases.len(), 1);
    assert!(releases[0].as_deref().unwrap().contains("dropped"));
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_dropped_one_shot_still_releases() {
    let pool = MockPool::new().run_delay(Duration::from_millis(50));
    let ctx = context(&pool);

    let mut stream = ctx.exec("INSERT INTO t VALUES (1)");
    let pending = tokio::time::timeout(Duration::from_millis(5), stream.next()).await;
    assert!(pending.is_err());
    drop(stream);

    pool.wait_for_releases(1).await;
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_one_shot_statements() {
    let pool = MockPool::new().fail_sql("missing");
    let ctx = context(&pool);

    let records: Vec<Record> = ctx.exec("UPDATE t SET v = 2").try_collect().await.unwrap();
    assert_eq!(records, vec![Record::Count(1)]);

    let records: Vec<Record> = ctx
        .prepare("SELECT v FROM t WHERE v > $1", params![0])
        .try_collect()
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.as_count().is_none()));

    let records: Vec<Record> = ctx
        .prepare("INSERT INTO t(v) VALUES ($1) RETURNING v", params![7])
        .try_collect()
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records[0].as_row().is_some());
    assert_eq!(records[1], Record::Count(1));

    let err = ctx
        .exec("SELECT * FROM missing")
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();

    assert_eq!(
        pool.releases(),
        vec![None, None, None, Some(err.to_string())]
    );
    assert!(pool.commands().is_empty());
}

#[tokio::test]
async fn test_one_shot_acquire_failure() {
    let pool = MockPool::new().fail_acquire();
    let ctx = context(&pool);

    let results: Vec<DbResult<Record>> = ctx.exec("SELECT 1").collect().await;
    assert_eq!(results.len(), 1);
    let err = results[0].as_ref().unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(err.to_string(), "pgerror(08001):connection refused");
    assert!(pool.releases().is_empty());
}

#[tokio::test]
async fn test_identical_sql_shares_statement_name() {
    let pool = MockPool::new();
    let ctx = context(&pool);
    let sql = "SELECT v FROM t WHERE v = $1";

    for value in [1, 2] {
        ctx.prepare(sql, params![value])
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
    }
    ctx.transaction(move |tx| Ok(tx.prepare(sql, params![3])))
        .try_collect::<Vec<_>>()
        .await
        .unwrap();

    let expected = StatementName::for_sql(sql).to_string();
    assert_eq!(pool.statement_names(), vec![expected.clone(), expected.clone(), expected]);
}

#[tokio::test]
async fn test_procedure_is_empty() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let values: Vec<Record> = ctx
        .procedure("refresh_totals", params![1])
        .try_collect()
        .await
        .unwrap();
    assert!(values.is_empty());
    assert!(pool.events().is_empty());

    let values: Vec<Record> = ctx
        .transaction(|tx| Ok(tx.procedure("refresh_totals", params!["a"])))
        .try_collect()
        .await
        .unwrap();
    assert!(values.is_empty());
    assert_eq!(pool.releases(), vec![None]);
}

#[tokio::test]
async fn test_transaction_ids_are_unique() {
    let pool = MockPool::new();
    let ctx = context(&pool);

    let ids: Vec<String> = ctx
        .transaction(|tx| Ok(stream::iter([Ok(tx.id().to_string())])))
        .chain(ctx.transaction(|tx| Ok(stream::iter([Ok(tx.id().to_string())]))))
        .try_collect()
        .await
        .unwrap();

    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.starts_with("tx_")));
    assert_ne!(ids[0], ids[1]);
    assert_eq!(pool.releases(), vec![None, None]);
}
