//! Pooled execution context.
//!
//! [`PooledContext`] is the entry point for running SQL. One-shot statements
//! borrow a connection for exactly one command. Transactions hold a connection
//! from `BEGIN` until the body's stream settles, then commit, or roll back
//! when the body fails.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tracing::{debug, error, info, warn};

use crate::db::executor::QueryExecutor;
use crate::db::pool::{
    ConnectionPool, DbPool, PooledConnection, TransactionCommand, run_detached,
};
use crate::db::statement::Statement;
use crate::db::transaction::TransactionHandle;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, QueryOutcome, QueryParam, Record};

/// Executes statements and transactions against a shared connection pool.
pub struct PooledContext<P: ConnectionPool = DbPool> {
    pool: Arc<P>,
    executor: QueryExecutor,
}

impl<P: ConnectionPool> Clone for PooledContext<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            executor: self.executor.clone(),
        }
    }
}

impl PooledContext<DbPool> {
    /// Open a sqlx pool for `config` and wrap it.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let pool = DbPool::connect(config).await?;
        if let Some(version) = pool.server_version().await {
            info!(id = %config.id, version = %version, "Connected to database");
        }
        Ok(Self::new(pool))
    }

    /// Close the underlying pool. Connections still checked out are closed
    /// when they are released.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl<P: ConnectionPool> PooledContext<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool: Arc::new(pool),
            executor: QueryExecutor::default(),
        }
    }

    /// Replace the executor (timeout and row decoding) used for every statement.
    pub fn with_executor(mut self, executor: QueryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Run a parameterized statement on a connection of its own.
    ///
    /// Read commands emit one [`Record::Row`] per row. Everything else emits a
    /// single [`Record::Count`].
    pub fn prepare(
        &self,
        sql: impl Into<String>,
        params: impl IntoIterator<Item = QueryParam>,
    ) -> BoxStream<'static, DbResult<Record>> {
        let statement = Statement::prepared(
            sql,
            params.into_iter().collect(),
            self.pool.database_type(),
        );
        self.run_once(statement)
    }

    /// Run unparameterized SQL on a connection of its own.
    pub fn exec(&self, sql: impl Into<String>) -> BoxStream<'static, DbResult<Record>> {
        let statement = Statement::raw(sql, self.pool.database_type());
        self.run_once(statement)
    }

    /// Reserved for stored procedure support; yields nothing.
    pub fn procedure<T: Send + 'static>(
        &self,
        name: &str,
        params: impl IntoIterator<Item = QueryParam>,
    ) -> BoxStream<'static, DbResult<T>> {
        debug!(
            procedure = name,
            params = params.into_iter().count(),
            "Procedure calls are not supported, returning empty result"
        );
        stream::empty().boxed()
    }

    /// Run `body` inside a transaction.
    ///
    /// The body is called once with a fresh [`TransactionHandle`] and returns
    /// the stream whose values are forwarded to the caller. When that stream
    /// completes the transaction is committed, unless the body already ended
    /// it. If the body returns `Err`, panics, or its stream yields an error,
    /// the transaction is rolled back and that error is surfaced. Should the
    /// rollback fail too, its error is surfaced instead.
    pub fn transaction<T, F, S>(&self, body: F) -> BoxStream<'static, DbResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(TransactionHandle<P>) -> DbResult<S> + Send + 'static,
        S: Stream<Item = DbResult<T>> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let executor = self.executor.clone();

        Box::pin(async_stream::stream! {
            // The handle is built on the detached task, so a caller that goes
            // away during BEGIN leaves it to be dropped there and rolled back.
            let started = run_detached(async move {
                let connection = begin(Arc::clone(&pool)).await?;
                Ok(TransactionHandle::new(pool, connection, executor))
            });
            let handle = match started.await {
                Ok(handle) => handle,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let invoked = match catch_unwind(AssertUnwindSafe(|| body(handle.clone()))) {
                Ok(result) => result,
                Err(payload) => Err(DbError::from_panic(payload)),
            };
            let body_stream = match invoked {
                Ok(body_stream) => body_stream,
                Err(e) => {
                    yield Err(abort(&handle, e).await);
                    return;
                }
            };

            let mut body_stream = std::pin::pin!(body_stream);
            while let Some(item) = body_stream.next().await {
                match item {
                    Ok(value) => yield Ok(value),
                    Err(e) => {
                        yield Err(abort(&handle, e).await);
                        return;
                    }
                }
            }

            if let Err(e) = handle.commit::<()>(None).try_collect::<Vec<_>>().await {
                yield Err(e);
            }
        })
    }

    fn run_once(&self, statement: Statement) -> BoxStream<'static, DbResult<Record>> {
        let pool = Arc::clone(&self.pool);
        let executor = self.executor.clone();

        Box::pin(try_stream! {
            let outcome = run_detached(execute_once(pool, statement, executor)).await?;
            for record in outcome.into_records() {
                yield record;
            }
        })
    }
}

/// Acquire, run one statement, release. The release is tagged on failure.
async fn execute_once<P: ConnectionPool>(
    pool: Arc<P>,
    statement: Statement,
    executor: QueryExecutor,
) -> DbResult<QueryOutcome> {
    let mut connection = pool.acquire().await.inspect_err(|e| {
        error!(statement = %statement.name(), error = %e, "Failed to acquire connection");
    })?;

    match connection.run(&statement, &executor).await {
        Ok(outcome) => {
            pool.release(connection, None).await;
            Ok(outcome)
        }
        Err(e) => {
            error!(statement = %statement.name(), error = %e, "Statement failed");
            pool.release(connection, Some(&e)).await;
            Err(e)
        }
    }
}

/// Acquire a connection and open a transaction on it.
async fn begin<P: ConnectionPool>(pool: Arc<P>) -> DbResult<P::Connection> {
    let mut connection = pool.acquire().await.inspect_err(|e| {
        error!(error = %e, "Failed to acquire connection for transaction");
    })?;

    match connection.command(TransactionCommand::Begin).await {
        Ok(()) => Ok(connection),
        Err(e) => {
            error!(error = %e, "BEGIN failed");
            pool.release(connection, Some(&e)).await;
            Err(e)
        }
    }
}

/// Roll back after a body failure and pick the error to surface.
async fn abort<P: ConnectionPool>(handle: &TransactionHandle<P>, cause: DbError) -> DbError {
    warn!(
        transaction_id = %handle.id(),
        error = %cause,
        "Transaction body failed, rolling back"
    );
    match handle
        .rollback_with_error(cause.clone())
        .try_collect::<Vec<_>>()
        .await
    {
        Ok(_) => cause,
        Err(rollback_error) => rollback_error,
    }
}
