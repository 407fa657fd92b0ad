//! db-context library
//!
//! A pooled database context for PostgreSQL, MySQL and SQLite with streaming
//! results and transactions that commit when their body completes and roll
//! back when it fails.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{PooledContext, TransactionHandle};
pub use error::{DbError, DbResult};
pub use models::{QueryParam, Record};
