//! Storage engine module providing etcd-style MVCC semantics on a relational table.
//!
//! Every mutation appends one row to a single `key_value` table; the database assigns the
//! row id and that id *is* the revision. Point-in-time reads are answered by a single SQL
//! statement that picks, per key, the row with the largest id not exceeding the requested
//! revision. Nothing is cached: every operation is one database round trip.
//!
//! The pieces, leaves first:
//! 1. **Dialect**: rewrites `?` placeholders into the bind syntax a driver expects
//! 2. **Schema**: the table layout, the `Record` row type and DDL bootstrap
//! 3. **Statements**: SQL templates rendered once when the engine is opened
//! 4. **Generic**: revision allocation, range queries and compaction bookkeeping
//!
//! The `Compactor` is a caller of the engine that trims history below a retention window.

pub mod backend;
pub mod compaction;
pub mod context;
pub mod dialect;
pub mod generic;
pub mod schema;
pub mod statements;

pub use backend::{Database, ExecResult, SqlValue, SqliteDatabase};
pub use compaction::{CompactionMode, Compactor};
pub use context::Context;
pub use dialect::Dialect;
pub use generic::{EngineConfig, Generic, InsertStrategy, Listing};
pub use schema::{Record, COMPACT_REV_KEY};
pub use statements::Statements;

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compaction error: {0}")]
    Compaction(String),
}

impl StorageError {
    /// True when the caller gave up, as opposed to the database failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StorageError::Cancelled | StorageError::DeadlineExceeded)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
