//! Error types for the database context.
//!
//! Every failure that originates in the database (or in reaching it) carries a
//! SQLSTATE-style `code` and a human readable `detail`, and displays as
//! `pgerror(<code>):<detail>`. Statement timeouts and internal task failures
//! use the same format. Caller-side conditions (aborts, terminated handles,
//! bad input) use plain messages.

use std::any::Any;

use thiserror::Error;

/// Code used when the server did not report a SQLSTATE.
const UNKNOWN_CODE: &str = "XX000";

/// `query_canceled`, reported for statements cut off by the executor timeout.
const QUERY_CANCELED_CODE: &str = "57014";

#[derive(Error, Debug, Clone)]
pub enum DbError {
    /// The pool could not hand out a connection.
    #[error("pgerror({code}):{detail}")]
    Connection { code: String, detail: String },

    /// The server rejected or failed a statement.
    #[error("pgerror({code}):{detail}")]
    Database { code: String, detail: String },

    #[error("operation on terminated transaction (transaction: {transaction_id})")]
    TerminatedTransaction { transaction_id: String },

    /// COMMIT failed and the compensating ROLLBACK failed too.
    ///
    /// `code` and `detail` describe the rollback failure.
    #[error("pgerror({code}):{detail}")]
    CompensatingRollback {
        code: String,
        detail: String,
        #[source]
        commit_error: Box<DbError>,
    },

    /// A ROLLBACK issued because of `cause` failed itself.
    #[error("pgerror({code}):{detail}")]
    DoubleRollback {
        code: String,
        detail: String,
        #[source]
        cause: Box<DbError>,
    },

    /// A statement ran past the executor timeout.
    #[error("pgerror(57014):{detail}")]
    Timeout { detail: String, elapsed_secs: u64 },

    /// Raised by application code, a panicking transaction body, or a
    /// transaction dropped before it finished.
    #[error("Transaction aborted: {message}")]
    Aborted { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("pgerror(XX000):{message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection acquisition error.
    pub fn connection(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Connection {
            code: code.into(),
            detail: detail.into(),
        }
    }

    /// Create a statement execution error.
    pub fn database(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            detail: detail.into(),
        }
    }

    pub fn terminated(transaction_id: impl Into<String>) -> Self {
        Self::TerminatedTransaction {
            transaction_id: transaction_id.into(),
        }
    }

    /// Wrap a failed compensating rollback, keeping the commit failure as the source.
    pub fn compensating_rollback(rollback_error: DbError, commit_error: DbError) -> Self {
        let (code, detail) = rollback_error.code_and_detail();
        Self::CompensatingRollback {
            code,
            detail,
            commit_error: Box::new(commit_error),
        }
    }

    /// Wrap a failed rollback, keeping the error that triggered it as the source.
    pub fn double_rollback(rollback_error: DbError, cause: DbError) -> Self {
        let (code, detail) = rollback_error.code_and_detail();
        Self::DoubleRollback {
            code,
            detail,
            cause: Box::new(cause),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            detail: format!("{} exceeded {}s", operation.into(), elapsed_secs),
            elapsed_secs,
        }
    }

    /// Create an application-level abort, used to fail a transaction body.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Build an abort error from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "transaction body panicked".to_string()
        };
        Self::aborted(message)
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convert a failure seen while acquiring a connection.
    ///
    /// Server errors during connect (authentication, unknown database) keep
    /// their SQLSTATE but are reported as connection failures.
    pub fn acquisition(err: sqlx::Error) -> Self {
        match Self::from(err) {
            Self::Database { code, detail } => Self::Connection { code, detail },
            other => other,
        }
    }

    /// SQLSTATE-style code, `None` for caller-side conditions.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. }
            | Self::Database { code, .. }
            | Self::CompensatingRollback { code, .. }
            | Self::DoubleRollback { code, .. } => Some(code),
            Self::Timeout { .. } => Some(QUERY_CANCELED_CODE),
            Self::Internal { .. } => Some(UNKNOWN_CODE),
            _ => None,
        }
    }

    /// Detail text paired with [`DbError::code`].
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Connection { detail, .. }
            | Self::Database { detail, .. }
            | Self::CompensatingRollback { detail, .. }
            | Self::DoubleRollback { detail, .. }
            | Self::Timeout { detail, .. } => Some(detail),
            Self::Internal { message } => Some(message),
            _ => None,
        }
    }

    /// Check if the error came from failing to obtain a connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    fn code_and_detail(&self) -> (String, String) {
        match (self.code(), self.detail()) {
            (Some(code), Some(detail)) => (code.to_string(), detail.to_string()),
            _ => (UNKNOWN_CODE.to_string(), self.to_string()),
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| UNKNOWN_CODE.to_string());
                let detail = match db_err
                    .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                    .and_then(|pg| pg.detail())
                {
                    Some(extra) => format!("{}: {}", db_err.message(), extra),
                    None => db_err.message().to_string(),
                };
                DbError::database(code, detail)
            }
            sqlx::Error::Configuration(msg) => DbError::connection("08001", msg.to_string()),
            sqlx::Error::Io(io_err) => DbError::connection("08001", format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DbError::connection("08001", format!("TLS error: {}", tls_err))
            }
            sqlx::Error::PoolTimedOut => {
                DbError::connection("08001", "timed out waiting for a pooled connection")
            }
            sqlx::Error::PoolClosed => DbError::connection("08003", "connection pool is closed"),
            sqlx::Error::Protocol(msg) => {
                DbError::connection("08P01", format!("protocol error: {}", msg))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::database("22000", format!("failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::database("22000", format!("decode error: {}", source)),
            sqlx::Error::RowNotFound => DbError::database("02000", "no rows returned"),
            sqlx::Error::WorkerCrashed => DbError::internal("database worker crashed"),
            _ => DbError::internal(format!("unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
