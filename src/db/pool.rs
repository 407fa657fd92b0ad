//! Connection pool abstraction.
//!
//! The context and transaction layers only see two capabilities:
//! [`ConnectionPool`] hands out exclusively owned connections and takes them
//! back, and [`PooledConnection`] runs statements and transaction commands.
//! Every acquisition must be matched by exactly one `release`, optionally
//! tagged with the error that ended the connection's use; the pool decides
//! what a tag means.
//!
//! The production implementation wraps database-specific sqlx pools
//! (MySqlPool, PgPool, SqlitePool) to keep full type support. A tagged
//! release discards the physical connection instead of returning it.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use sqlx::pool::PoolConnection;
use sqlx::{
    MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions, postgres::PgConnectOptions,
    sqlite::SqliteConnectOptions,
};
use tracing::{debug, info, warn};

use crate::db::executor::{self, QueryExecutor};
use crate::db::statement::Statement;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryOutcome};

/// Transaction control statements issued on a held connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionCommand {
    Begin,
    Commit,
    Rollback,
}

impl TransactionCommand {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for TransactionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A source of exclusively owned connections.
pub trait ConnectionPool: Send + Sync + 'static {
    type Connection: PooledConnection;

    /// Backend type, used to pick the SQL dialect for statements.
    fn database_type(&self) -> DatabaseType;

    fn acquire(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Give a connection back. `error` is the failure that ended its use, if any.
    fn release(
        &self,
        connection: Self::Connection,
        error: Option<&DbError>,
    ) -> impl Future<Output = ()> + Send;
}

/// A connection checked out of a [`ConnectionPool`].
pub trait PooledConnection: Send + 'static {
    fn run(
        &mut self,
        statement: &Statement,
        executor: &QueryExecutor,
    ) -> impl Future<Output = DbResult<QueryOutcome>> + Send;

    fn command(&mut self, command: TransactionCommand) -> impl Future<Output = DbResult<()>> + Send;
}

/// Run `future` on its own task so it settles even if the caller stops polling.
pub(crate) async fn run_detached<T, F>(future: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(future)
        .await
        .map_err(|e| DbError::internal(format!("background task failed: {}", e)))?
}

// =============================================================================
// sqlx-backed pool
// =============================================================================

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

/// A connection checked out of a [`DbPool`].
pub enum DbConnection {
    MySql(PoolConnection<sqlx::MySql>),
    Postgres(PoolConnection<sqlx::Postgres>),
    SQLite(PoolConnection<sqlx::Sqlite>),
}

/// sqlx pool options with the configured size and acquire timeout.
fn sized<DB: sqlx::Database>(config: &ConnectionConfig) -> sqlx::pool::PoolOptions<DB> {
    sqlx::pool::PoolOptions::new()
        .max_connections(config.pool_options.max_connections_for(config.db_type))
        .acquire_timeout(config.pool_options.acquire_timeout())
}

impl DbPool {
    /// Create a connection pool for the given configuration.
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let max_connections = config.pool_options.max_connections_for(config.db_type);
        info!(
            id = %config.id,
            db_type = %config.db_type,
            url = %config.masked_connection_string(),
            max_connections,
            "Creating connection pool"
        );

        let invalid = |e: sqlx::Error| {
            DbError::invalid_input(format!("Invalid {} connection string: {}", config.db_type, e))
        };
        let pool = match config.db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(&config.connection_string)
                    .map_err(invalid)?
                    .charset("utf8mb4");
                sized::<sqlx::MySql>(config)
                    .connect_with(options)
                    .await
                    .map(DbPool::MySql)
            }
            DatabaseType::PostgreSQL => {
                let options =
                    PgConnectOptions::from_str(&config.connection_string).map_err(invalid)?;
                sized::<sqlx::Postgres>(config)
                    .connect_with(options)
                    .await
                    .map(DbPool::Postgres)
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.connection_string)
                    .map_err(invalid)?
                    .create_if_missing(true);
                sized::<sqlx::Sqlite>(config)
                    .connect_with(options)
                    .await
                    .map(DbPool::SQLite)
            }
        };

        pool.map_err(|e| {
            warn!(id = %config.id, error = %e, "Failed to create connection pool");
            DbError::acquisition(e)
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Get the server version from the connected database.
    pub async fn server_version(&self) -> Option<String> {
        let result = match self {
            DbPool::MySql(pool) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(pool)
                    .await
            }
            DbPool::Postgres(pool) => {
                sqlx::query_scalar::<_, String>("SELECT version()")
                    .fetch_one(pool)
                    .await
            }
            DbPool::SQLite(pool) => {
                sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                    .fetch_one(pool)
                    .await
            }
        };

        match result {
            Ok(version) => {
                debug!(version = %version, "Got server version");
                Some(version)
            }
            Err(e) => {
                warn!(error = %e, "Failed to get server version");
                None
            }
        }
    }
}

/// Return a connection to its pool, or discard it when the release is tagged.
async fn finish<DB: sqlx::Database>(connection: PoolConnection<DB>, error: Option<&DbError>) {
    use sqlx::Connection;

    match error {
        None => drop(connection),
        Some(error) => {
            warn!(error = %error, "Discarding connection after failure");
            if let Err(e) = connection.detach().close().await {
                debug!(error = %e, "Error while closing discarded connection");
            }
        }
    }
}

impl ConnectionPool for DbPool {
    type Connection = DbConnection;

    fn database_type(&self) -> DatabaseType {
        self.db_type()
    }

    async fn acquire(&self) -> DbResult<DbConnection> {
        let connection = match self {
            DbPool::MySql(pool) => pool.acquire().await.map(DbConnection::MySql),
            DbPool::Postgres(pool) => pool.acquire().await.map(DbConnection::Postgres),
            DbPool::SQLite(pool) => pool.acquire().await.map(DbConnection::SQLite),
        };
        connection.map_err(|e| {
            warn!(db_type = %self.db_type(), error = %e, "Failed to acquire connection");
            DbError::acquisition(e)
        })
    }

    async fn release(&self, connection: DbConnection, error: Option<&DbError>) {
        match connection {
            DbConnection::MySql(conn) => finish(conn, error).await,
            DbConnection::Postgres(conn) => finish(conn, error).await,
            DbConnection::SQLite(conn) => finish(conn, error).await,
        }
    }
}

impl PooledConnection for DbConnection {
    async fn run(&mut self, statement: &Statement, executor: &QueryExecutor) -> DbResult<QueryOutcome> {
        match self {
            DbConnection::MySql(conn) => executor::mysql::run(&mut **conn, statement, executor).await,
            DbConnection::Postgres(conn) => {
                executor::postgres::run(&mut **conn, statement, executor).await
            }
            DbConnection::SQLite(conn) => {
                executor::sqlite::run(&mut **conn, statement, executor).await
            }
        }
    }

    async fn command(&mut self, command: TransactionCommand) -> DbResult<()> {
        use sqlx::Executor;

        let sql = command.as_sql();
        let result = match self {
            DbConnection::MySql(conn) => (&mut **conn).execute(sql).await.map(|_| ()),
            DbConnection::Postgres(conn) => (&mut **conn).execute(sql).await.map(|_| ()),
            DbConnection::SQLite(conn) => (&mut **conn).execute(sql).await.map(|_| ()),
        };
        result.map_err(DbError::from)
    }
}
