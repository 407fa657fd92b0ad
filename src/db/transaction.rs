//! Transaction handle.
//!
//! A [`TransactionHandle`] owns one pooled connection on which `BEGIN` has
//! already succeeded. Statements run on that connection in the order they are
//! issued. Exactly one of `commit`, `rollback` or `rollback_with_error` takes
//! effect per handle; it marks the handle terminated, settles the server-side
//! transaction and releases the connection. Later terminal calls are no-ops and
//! later statements fail with [`DbError::TerminatedTransaction`].
//!
//! Terminal operations run on a detached task, so dropping their stream does
//! not leave the connection unreleased. A handle dropped while still active
//! rolls back and discards its connection from its destructor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::try_stream;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::db::executor::QueryExecutor;
use crate::db::pool::{ConnectionPool, PooledConnection, TransactionCommand, run_detached};
use crate::db::statement::Statement;
use crate::error::{DbError, DbResult};
use crate::models::{QueryOutcome, QueryParam, Record, TransactionState};

/// Generate a unique transaction ID.
pub fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Handle to an open transaction. Clones share the same connection and state.
pub struct TransactionHandle<P: ConnectionPool> {
    inner: Arc<TransactionInner<P>>,
}

impl<P: ConnectionPool> Clone for TransactionHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ConnectionPool> std::fmt::Debug for TransactionHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct TransactionInner<P: ConnectionPool> {
    id: String,
    pool: Arc<P>,
    executor: QueryExecutor,
    /// `None` once a terminal operation has taken the connection.
    connection: Mutex<Option<P::Connection>>,
    terminated: AtomicBool,
}

impl<P: ConnectionPool> TransactionHandle<P> {
    /// Wrap a connection on which `BEGIN` has succeeded.
    pub(crate) fn new(pool: Arc<P>, connection: P::Connection, executor: QueryExecutor) -> Self {
        let id = generate_transaction_id();
        info!(
            transaction_id = %id,
            db_type = %pool.database_type(),
            "Transaction started"
        );

        Self {
            inner: Arc::new(TransactionInner {
                id,
                pool,
                executor,
                connection: Mutex::new(Some(connection)),
                terminated: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        if self.is_terminated() {
            TransactionState::Terminated
        } else {
            TransactionState::Active
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Run a statement with bound parameters on the transaction's connection.
    pub fn prepare(
        &self,
        sql: impl Into<String>,
        params: impl IntoIterator<Item = QueryParam>,
    ) -> BoxStream<'static, DbResult<Record>> {
        let statement = Statement::prepared(
            sql,
            params.into_iter().collect(),
            self.inner.pool.database_type(),
        );
        self.run_statement(statement)
    }

    /// Run unparameterized SQL on the transaction's connection.
    pub fn exec(&self, sql: impl Into<String>) -> BoxStream<'static, DbResult<Record>> {
        let statement = Statement::raw(sql, self.inner.pool.database_type());
        self.run_statement(statement)
    }

    /// Reserved for stored procedure support; yields nothing.
    pub fn procedure<T: Send + 'static>(
        &self,
        name: &str,
        params: impl IntoIterator<Item = QueryParam>,
    ) -> BoxStream<'static, DbResult<T>> {
        debug!(
            transaction_id = %self.inner.id,
            procedure = name,
            params = params.into_iter().count(),
            "Procedure calls are not supported, returning empty result"
        );
        stream::empty().boxed()
    }

    /// Commit, then emit `value` if given.
    ///
    /// If COMMIT fails a compensating ROLLBACK is issued. The stream errors
    /// with the commit failure when that rollback succeeds, or with
    /// [`DbError::CompensatingRollback`] when it fails too.
    pub fn commit<T: Send + 'static>(&self, value: Option<T>) -> BoxStream<'static, DbResult<T>> {
        if !self.begin_termination("commit") {
            return stream::empty().boxed();
        }
        let inner = Arc::clone(&self.inner);
        Box::pin(try_stream! {
            run_detached(async move { inner.finish_commit().await }).await?;
            if let Some(value) = value {
                yield value;
            }
        })
    }

    /// Roll back, then emit `value` if given.
    pub fn rollback<T: Send + 'static>(&self, value: Option<T>) -> BoxStream<'static, DbResult<T>> {
        if !self.begin_termination("rollback") {
            return stream::empty().boxed();
        }
        let inner = Arc::clone(&self.inner);
        Box::pin(try_stream! {
            run_detached(async move { inner.finish_rollback().await }).await?;
            if let Some(value) = value {
                yield value;
            }
        })
    }

    /// Roll back because of `error`.
    ///
    /// The connection is released tagged with `error`. If the rollback itself
    /// fails the stream errors with [`DbError::DoubleRollback`], which keeps
    /// `error` as its source.
    pub fn rollback_with_error(&self, error: DbError) -> BoxStream<'static, DbResult<()>> {
        if !self.begin_termination("rollback_with_error") {
            return stream::empty().boxed();
        }
        let inner = Arc::clone(&self.inner);
        stream::once(run_detached(async move {
            inner.finish_rollback_with_error(error).await
        }))
        .filter_map(|result| future::ready(result.err().map(Err)))
        .boxed()
    }

    /// Mark the handle terminated. Returns false if it already was.
    fn begin_termination(&self, operation: &str) -> bool {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            debug!(
                transaction_id = %self.inner.id,
                operation,
                "Transaction already terminated, ignoring"
            );
            return false;
        }
        true
    }

    fn run_statement(&self, statement: Statement) -> BoxStream<'static, DbResult<Record>> {
        if self.is_terminated() {
            warn!(
                transaction_id = %self.inner.id,
                statement = %statement.name(),
                "Statement issued on terminated transaction"
            );
            let error = DbError::terminated(self.inner.id.clone());
            return stream::once(future::ready(Err(error))).boxed();
        }

        let inner = Arc::clone(&self.inner);
        Box::pin(try_stream! {
            let outcome = inner.run(&statement).await?;
            for record in outcome.into_records() {
                yield record;
            }
        })
    }
}

impl<P: ConnectionPool> TransactionInner<P> {
    async fn run(&self, statement: &Statement) -> DbResult<QueryOutcome> {
        let mut guard = self.connection.lock().await;
        // A terminal operation may have taken the connection while we waited
        let connection = guard
            .as_mut()
            .ok_or_else(|| DbError::terminated(self.id.clone()))?;

        connection
            .run(statement, &self.executor)
            .await
            .inspect_err(|e| {
                error!(
                    transaction_id = %self.id,
                    statement = %statement.name(),
                    error = %e,
                    "Statement failed in transaction"
                );
            })
    }

    async fn take_connection(&self) -> Option<P::Connection> {
        self.connection.lock().await.take()
    }

    async fn finish_commit(&self) -> DbResult<()> {
        let Some(mut connection) = self.take_connection().await else {
            return Ok(());
        };

        let commit_error = match connection.command(TransactionCommand::Commit).await {
            Ok(()) => {
                self.pool.release(connection, None).await;
                info!(transaction_id = %self.id, "Transaction committed");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(
            transaction_id = %self.id,
            error = %commit_error,
            "Commit failed, rolling back"
        );
        match connection.command(TransactionCommand::Rollback).await {
            Ok(()) => {
                self.pool.release(connection, None).await;
                info!(transaction_id = %self.id, "Transaction rolled back after failed commit");
                Err(commit_error)
            }
            Err(rollback_error) => {
                error!(
                    transaction_id = %self.id,
                    commit_error = %commit_error,
                    rollback_error = %rollback_error,
                    "Rollback after failed commit also failed"
                );
                self.pool.release(connection, Some(&commit_error)).await;
                Err(DbError::compensating_rollback(rollback_error, commit_error))
            }
        }
    }

    async fn finish_rollback(&self) -> DbResult<()> {
        let Some(mut connection) = self.take_connection().await else {
            return Ok(());
        };

        match connection.command(TransactionCommand::Rollback).await {
            Ok(()) => {
                self.pool.release(connection, None).await;
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                error!(transaction_id = %self.id, error = %e, "Rollback failed");
                self.pool.release(connection, Some(&e)).await;
                Err(e)
            }
        }
    }

    async fn finish_rollback_with_error(&self, cause: DbError) -> DbResult<()> {
        let Some(mut connection) = self.take_connection().await else {
            return Ok(());
        };

        match connection.command(TransactionCommand::Rollback).await {
            Ok(()) => {
                self.pool.release(connection, Some(&cause)).await;
                info!(
                    transaction_id = %self.id,
                    cause = %cause,
                    "Transaction rolled back after error"
                );
                Ok(())
            }
            Err(rollback_error) => {
                error!(
                    transaction_id = %self.id,
                    cause = %cause,
                    rollback_error = %rollback_error,
                    "Rollback after error failed"
                );
                let error = DbError::double_rollback(rollback_error, cause);
                self.pool.release(connection, Some(&error)).await;
                Err(error)
            }
        }
    }
}

impl<P: ConnectionPool> Drop for TransactionInner<P> {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.get_mut().take() else {
            return;
        };

        warn!(
            transaction_id = %self.id,
            "Transaction dropped while active, rolling back"
        );

        let pool = Arc::clone(&self.pool);
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let error =
                        DbError::aborted(format!("transaction {} dropped before completion", id));
                    if let Err(e) = connection.command(TransactionCommand::Rollback).await {
                        warn!(transaction_id = %id, error = %e, "Implicit rollback failed");
                    }
                    pool.release(connection, Some(&error)).await;
                });
            }
            Err(_) => {
                warn!(
                    transaction_id = %self.id,
                    "No runtime available, connection dropped without release"
                );
            }
        }
    }
}
