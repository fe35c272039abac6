//! # kvsql: etcd-style revisioned key-value storage on a SQL table
//!
//! kvsql gives a cluster-coordination layer the storage semantics it expects from etcd while
//! keeping the data in an ordinary relational database:
//!
//! - **Monotonic revisions**: every write appends a row whose database-assigned id is its revision
//! - **Point-in-time reads**: list any prefix as of any retained revision
//! - **Tombstones**: deletes are versions too, visible to change-feed readers
//! - **Compaction bookkeeping**: a persisted floor below which history may be trimmed
//! - **Dialects as data**: placeholder style and RETURNING support are configuration
//!
//! Consistency comes from the database: each operation is a single statement, and the only
//! lock held by the engine serializes inserts on drivers that cannot return generated ids.
//!
//! # Usage
//!
//! ```no_run
//! use kvsql::{Context, Generic};
//!
//! let engine = Generic::open("sqlite", "state.db", "?", false)?;
//! let ctx = Context::background();
//!
//! let rev = engine.insert(&ctx, "/registry/a", true, false, 0, 0, 0, b"1", None)?;
//! let listing = engine.list_current(&ctx, "/registry/", 0, false)?;
//! assert_eq!(listing.records[0].id, rev);
//! # Ok::<(), kvsql::StorageError>(())
//! ```

pub mod storage;

// Re-export main types at crate root for convenience
pub use storage::{
    CompactionMode, Compactor, Context, Dialect, EngineConfig, Generic, InsertStrategy, Listing,
    Record, StorageError, StorageResult,
};
