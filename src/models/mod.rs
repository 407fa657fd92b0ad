//! Data models shared by the pool, the executor and the transaction layer.

pub mod connection;
pub mod query;

pub use connection::{ConnectionConfig, DatabaseType, TransactionState};
pub use query::{
    DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS, QueryOutcome, QueryParam, Record, Row,
};
