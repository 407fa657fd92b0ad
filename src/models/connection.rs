//! Backend identification, pool configuration and transaction lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::PoolOptions;
use crate::error::{DbError, DbResult};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Detect the backend from the URL scheme.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let (scheme, _) = connection_string.split_once(':')?;
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        })
    }
}

/// Everything needed to open a pool for one database.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub db_type: DatabaseType,
    /// Contains credentials, log [`ConnectionConfig::masked_connection_string`] instead
    pub connection_string: String,
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Validate the id and detect the backend.
    ///
    /// Ids are non-empty and limited to alphanumerics, `-` and `_`.
    pub fn new(
        id: impl Into<String>,
        connection_string: impl Into<String>,
        pool_options: PoolOptions,
    ) -> DbResult<Self> {
        let id = id.into();
        let connection_string = connection_string.into();

        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DbError::invalid_input(format!("invalid connection id {:?}", id)));
        }

        let Some(db_type) = DatabaseType::from_connection_string(&connection_string) else {
            return Err(DbError::invalid_input(
                "unsupported database URL, expected postgres, mysql or sqlite",
            ));
        };

        Ok(Self {
            id,
            db_type,
            connection_string,
            pool_options,
        })
    }

    /// The connection string with any password replaced by `****`.
    pub fn masked_connection_string(&self) -> String {
        match Url::parse(&self.connection_string) {
            Ok(mut url) if url.password().is_some() => {
                // Only fails for URLs that cannot carry credentials
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.connection_string.clone(),
        }
    }
}

/// Lifecycle of a transaction handle. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    /// Committed, rolled back, or abandoned
    Terminated,
}
