//! Statement execution on a single connection.
//!
//! The executor never acquires or releases connections; callers hand it a
//! connection they already own. What it does with the statement depends on
//! the statement's [`CommandKind`]:
//! - reads fetch every row and decode it with the configured [`RowDecoder`]
//! - writes report the affected-row count
//! - writes with RETURNING fetch the returned rows
//!
//! Prepared statements go through `sqlx::query` with bound parameters (and
//! the driver's per-connection statement cache); raw statements are sent as
//! plain text, which also allows multi-statement scripts.
//!
//! # Architecture
//!
//! Database-specific implementations live in the `mysql`, `postgres` and
//! `sqlite` submodules with an identical shape.

use std::time::Duration;

use futures_util::TryStreamExt;
use tokio::time::timeout;
use tracing::debug;

use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::statement::{CommandKind, Statement};
use crate::db::types::{RowDecoder, RowToJson};
use crate::error::{DbError, DbResult};
use crate::models::{DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS, QueryOutcome};

/// Execution settings shared by every statement of a context.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    query_timeout: Duration,
    decoder: RowDecoder,
}

impl QueryExecutor {
    /// Create a new query executor with default settings.
    pub fn new() -> Self {
        Self {
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            decoder: RowDecoder::default(),
        }
    }

    /// Set the per-statement timeout, clamped to `1..=MAX_QUERY_TIMEOUT_SECS`.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.query_timeout = Duration::from_secs(timeout_secs.clamp(1, MAX_QUERY_TIMEOUT_SECS));
        self
    }

    pub fn with_decoder(mut self, decoder: RowDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn decoder(&self) -> &RowDecoder {
        &self.decoder
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_rows<R: RowToJson>(rows: &[R], decoder: &RowDecoder) -> Vec<crate::models::Row> {
    rows.iter().map(|r| r.to_json_map(decoder)).collect()
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs())
}

fn log_statement(statement: &Statement) {
    debug!(
        statement = %statement.name(),
        sql = %statement.sql(),
        params = statement.params().len(),
        kind = ?statement.kind(),
        prepared = statement.is_prepared(),
        "Executing statement"
    );
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

pub(crate) mod mysql {
    use super::*;
    use sqlx::mysql::{MySqlConnection, MySqlRow};

    pub async fn run(
        conn: &mut MySqlConnection,
        statement: &Statement,
        executor: &QueryExecutor,
    ) -> DbResult<QueryOutcome> {
        log_statement(statement);
        match statement.kind() {
            CommandKind::Read => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Rows(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::WriteReturning => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Returned(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::Write => execute_write(conn, statement, executor.query_timeout)
                .await
                .map(QueryOutcome::Affected),
        }
    }

    async fn fetch_rows(
        conn: &mut MySqlConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<MySqlRow>> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.fetch(&mut *conn).try_collect::<Vec<_>>()).await
        } else {
            use sqlx::Executor;
            let stream = (&mut *conn).fetch(statement.sql());
            timeout(query_timeout, stream.try_collect::<Vec<_>>()).await
        };

        match result {
            Ok(rows) => rows.map_err(DbError::from),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    async fn execute_write(
        conn: &mut MySqlConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut *conn)).await
        } else {
            use sqlx::Executor;
            timeout(query_timeout, (&mut *conn).execute(statement.sql())).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

pub(crate) mod postgres {
    use super::*;
    use sqlx::postgres::{PgConnection, PgRow};

    pub async fn run(
        conn: &mut PgConnection,
        statement: &Statement,
        executor: &QueryExecutor,
    ) -> DbResult<QueryOutcome> {
        log_statement(statement);
        match statement.kind() {
            CommandKind::Read => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Rows(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::WriteReturning => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Returned(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::Write => execute_write(conn, statement, executor.query_timeout)
                .await
                .map(QueryOutcome::Affected),
        }
    }

    async fn fetch_rows(
        conn: &mut PgConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<PgRow>> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.fetch(&mut *conn).try_collect::<Vec<_>>()).await
        } else {
            use sqlx::Executor;
            let stream = (&mut *conn).fetch(statement.sql());
            timeout(query_timeout, stream.try_collect::<Vec<_>>()).await
        };

        match result {
            Ok(rows) => rows.map_err(DbError::from),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    async fn execute_write(
        conn: &mut PgConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut *conn)).await
        } else {
            use sqlx::Executor;
            timeout(query_timeout, (&mut *conn).execute(statement.sql())).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

pub(crate) mod sqlite {
    use super::*;
    use sqlx::sqlite::{SqliteConnection, SqliteRow};

    pub async fn run(
        conn: &mut SqliteConnection,
        statement: &Statement,
        executor: &QueryExecutor,
    ) -> DbResult<QueryOutcome> {
        log_statement(statement);
        match statement.kind() {
            CommandKind::Read => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Rows(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::WriteReturning => {
                let rows = fetch_rows(conn, statement, executor.query_timeout).await?;
                Ok(QueryOutcome::Returned(decode_rows(&rows, &executor.decoder)))
            }
            CommandKind::Write => execute_write(conn, statement, executor.query_timeout)
                .await
                .map(QueryOutcome::Affected),
        }
    }

    async fn fetch_rows(
        conn: &mut SqliteConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<Vec<SqliteRow>> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.fetch(&mut *conn).try_collect::<Vec<_>>()).await
        } else {
            use sqlx::Executor;
            let stream = (&mut *conn).fetch(statement.sql());
            timeout(query_timeout, stream.try_collect::<Vec<_>>()).await
        };

        match result {
            Ok(rows) => rows.map_err(DbError::from),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    async fn execute_write(
        conn: &mut SqliteConnection,
        statement: &Statement,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let result = if statement.is_prepared() {
            let mut query = sqlx::query(statement.sql());
            for param in statement.params() {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.execute(&mut *conn)).await
        } else {
            use sqlx::Executor;
            timeout(query_timeout, (&mut *conn).execute(statement.sql())).await
        };

        match result {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}
