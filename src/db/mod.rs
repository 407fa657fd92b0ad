//! Database access layer.
//!
//! This module provides:
//! - The pooled execution context and transaction handles
//! - The connection pool abstraction and its sqlx implementation
//! - Statement naming and command classification
//! - Query execution and row decoding per backend

pub mod context;
pub mod executor;
pub mod params;
pub mod pool;
pub mod statement;
pub mod transaction;
pub mod types;

pub use context::PooledContext;
pub use executor::QueryExecutor;
pub use pool::{ConnectionPool, DbConnection, DbPool, PooledConnection, TransactionCommand};
pub use statement::{CommandKind, Statement, StatementName};
pub use transaction::TransactionHandle;
pub use types::{NumericMode, RowDecoder};
