//! The revision-versioned key-value engine.
//!
//! `Generic` owns a `Database` handle and the statements rendered for its dialect. Writes
//! append one row and hand back the database-assigned id as the new revision; reads are a
//! single statement each. The only lock the engine holds is around the last-insert-id
//! fallback, where "insert" and "read back the id" must not interleave with another insert.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::storage::dialect::Stripped;
use crate::storage::schema::COMPACT_REV_KEY;
use crate::storage::statements::{with_limit, LIKE_ESCAPE};
use crate::storage::{
    Context, Database, Dialect, ExecResult, Record, SqlValue, SqliteDatabase, Statements,
    StorageError, StorageResult,
};

/// How a new row's id is learned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertStrategy {
    /// `INSERT ... RETURNING id`; no engine-side locking.
    Returning,

    /// Plain insert followed by the driver's last generated id, serialized per engine.
    LastInsertId,
}

/// Configuration for opening an engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Driver identifier (`sqlite` or `sqlite3`).
    pub driver: String,

    /// Driver connection string. For SQLite a path, `file:` URI or `:memory:`.
    pub data_source: String,

    /// Placeholder marker, e.g. `?` or `$`.
    pub param_character: String,

    /// Number placeholders `$1..$n`.
    pub numbered: bool,

    /// Overrides the driver's default insert strategy.
    pub insert_strategy: Option<InsertStrategy>,

    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,

    /// Create the table and indexes on open.
    pub create_schema: bool,

    /// Read-only connections kept next to the write connection. Ignored for `:memory:`.
    pub read_pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            data_source: ":memory:".to_string(),
            param_character: "?".to_string(),
            numbered: false,
            insert_strategy: None,
            busy_timeout_ms: 5000,
            create_schema: true,
            read_pool_size: 4,
        }
    }
}

/// Records plus the global revision and compaction floor observed by the same statement.
///
/// Both header fields are 0 when `records` is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Listing {
    pub current_revision: i64,
    pub compact_revision: i64,
    pub records: Vec<Record>,
}

impl Listing {
    fn from_rows(rows: Vec<Vec<SqlValue>>) -> StorageResult<Self> {
        let mut listing = Listing::default();
        for (i, mut row) in rows.into_iter().enumerate() {
            if row.len() < 2 {
                return Err(StorageError::Decode(format!(
                    "listing row has {} columns",
                    row.len()
                )));
            }
            let record = Record::from_columns(row.split_off(2))?;
            if i == 0 {
                listing.current_revision = row[0].as_i64("current_revision")?;
                listing.compact_revision = row[1].as_i64("compact_revision")?;
            }
            listing.records.push(record);
        }
        Ok(listing)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

enum Allocator {
    Returning,
    LastInsertId(Mutex<()>),
}

/// Revision-versioned key-value engine over a SQL table.
pub struct Generic {
    db: Arc<dyn Database>,
    statements: Statements,
    allocator: Allocator,
}

impl Generic {
    /// Opens an engine for `driver` at `data_source` using the given placeholder style.
    pub fn open(
        driver: &str,
        data_source: &str,
        param_character: &str,
        numbered: bool,
    ) -> StorageResult<Self> {
        Self::open_with_config(&EngineConfig {
            driver: driver.to_string(),
            data_source: data_source.to_string(),
            param_character: param_character.to_string(),
            numbered,
            ..EngineConfig::default()
        })
    }

    pub fn open_with_config(config: &EngineConfig) -> StorageResult<Self> {
        if config.param_character.is_empty() {
            return Err(StorageError::Config(
                "param_character must not be empty".to_string(),
            ));
        }

        // Bundled SQLite understands RETURNING.
        let default_strategy = InsertStrategy::Returning;
        let db: Arc<dyn Database> = match config.driver.as_str() {
            "sqlite" | "sqlite3" => Arc::new(SqliteDatabase::open(
                &config.data_source,
                Duration::from_millis(config.busy_timeout_ms),
                config.read_pool_size,
            )?),
            other => return Err(StorageError::UnsupportedDriver(other.to_string())),
        };

        if config.create_schema {
            db.bootstrap(&Context::background())?;
        }

        let dialect = Dialect::new(config.param_character.clone(), config.numbered);
        let strategy = config.insert_strategy.unwrap_or(default_strategy);

        info!(
            "Opened {} engine (placeholder={:?}, numbered={}, insert={:?})",
            config.driver, dialect.param, dialect.numbered, strategy
        );

        Ok(Self::with_database(db, &dialect, strategy))
    }

    /// Builds an engine over an already-open database. The schema must exist.
    pub fn with_database(
        db: Arc<dyn Database>,
        dialect: &Dialect,
        strategy: InsertStrategy,
    ) -> Self {
        let allocator = match strategy {
            InsertStrategy::Returning => Allocator::Returning,
            InsertStrategy::LastInsertId => Allocator::LastInsertId(Mutex::new(())),
        };

        Self {
            db,
            statements: Statements::new(dialect),
            allocator,
        }
    }

    pub fn insert_strategy(&self) -> InsertStrategy {
        match self.allocator {
            Allocator::Returning => InsertStrategy::Returning,
            Allocator::LastInsertId(_) => InsertStrategy::LastInsertId,
        }
    }

    pub fn statements(&self) -> &Statements {
        &self.statements
    }

    fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> StorageResult<Vec<Vec<SqlValue>>> {
        trace!("QUERY {:?} : {}", args, Stripped(sql));
        self.db.query(ctx, sql, args)
    }

    /// First column of the first row, or `None` for an empty result.
    fn query_scalar(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
        column: &str,
    ) -> StorageResult<Option<i64>> {
        trace!("QUERY ROW {:?} : {}", args, Stripped(sql));
        first_i64(&self.db.query(ctx, sql, args)?, column)
    }

    fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> StorageResult<ExecResult> {
        trace!("EXEC {:?} : {}", args, Stripped(sql));
        self.db.execute(ctx, sql, args)
    }

    /// Appends one version of `key` and returns its revision.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        ctx: &Context,
        key: &str,
        create: bool,
        delete: bool,
        create_revision: i64,
        prev_revision: i64,
        lease: i64,
        value: &[u8],
        old_value: Option<&[u8]>,
    ) -> StorageResult<i64> {
        let args = [
            SqlValue::from(key),
            SqlValue::from(create),
            SqlValue::from(delete),
            SqlValue::from(create_revision),
            SqlValue::from(prev_revision),
            SqlValue::from(lease),
            SqlValue::from(value),
            SqlValue::from(old_value),
        ];

        match &self.allocator {
            Allocator::Returning => {
                let sql = &self.statements.insert_returning;
                trace!("QUERY ROW {:?} : {}", args, Stripped(sql));
                first_i64(&self.db.query_write(ctx, sql, &args)?, "id")?
                    .ok_or_else(|| StorageError::Decode("insert returned no id".to_string()))
            }
            Allocator::LastInsertId(lock) => {
                let _guard = lock.lock();
                let result = self.execute(ctx, &self.statements.insert, &args)?;
                Ok(result.last_insert_id)
            }
        }
    }

    /// The row at exactly `revision`, if it still exists.
    pub fn get_revision(&self, ctx: &Context, revision: i64) -> StorageResult<Option<Record>> {
        let rows = self.query(ctx, &self.statements.get_revision, &[revision.into()])?;
        Ok(Listing::from_rows(rows)?.records.into_iter().next())
    }

    /// Removes the row at `revision`. Deleting an absent revision is not an error.
    pub fn delete_revision(&self, ctx: &Context, revision: i64) -> StorageResult<()> {
        self.execute(ctx, &self.statements.delete, &[revision.into()])?;
        Ok(())
    }

    /// Latest version of every key under `prefix`, ordered by revision.
    pub fn list_current(
        &self,
        ctx: &Context,
        prefix: &str,
        limit: i64,
        include_deleted: bool,
    ) -> StorageResult<Listing> {
        let sql = with_limit(&self.statements.list_current, limit);
        let rows = self.query(ctx, &sql, &[like_prefix(prefix), include_deleted.into()])?;
        Listing::from_rows(rows)
    }

    /// Keys under `prefix` as of `revision`.
    ///
    /// With a non-empty `start_key`, only versions newer than the one `start_key` had at
    /// `revision` are considered, which continues a listing from a previous page.
    pub fn list(
        &self,
        ctx: &Context,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> StorageResult<Listing> {
        let rows = if start_key.is_empty() {
            let sql = with_limit(&self.statements.list_revision_start, limit);
            self.query(
                ctx,
                &sql,
                &[like_prefix(prefix), revision.into(), include_deleted.into()],
            )?
        } else {
            let sql = with_limit(&self.statements.list_revision_after, limit);
            self.query(
                ctx,
                &sql,
                &[
                    like_prefix(prefix),
                    revision.into(),
                    start_key.into(),
                    revision.into(),
                    include_deleted.into(),
                ],
            )?
        };
        Listing::from_rows(rows)
    }

    /// `(current revision, live keys under prefix)` from one statement.
    pub fn count(&self, ctx: &Context, prefix: &str) -> StorageResult<(i64, i64)> {
        let args = [like_prefix(prefix), false.into()];
        let rows = self.query(ctx, &self.statements.count, &args)?;
        let row = rows
            .first()
            .filter(|row| row.len() >= 2)
            .ok_or_else(|| StorageError::Decode("count returned no row".to_string()))?;
        Ok((row[0].as_i64("revision")?, row[1].as_i64("count")?))
    }

    /// Global high-water mark, 0 for an empty table.
    pub fn current_revision(&self, ctx: &Context) -> StorageResult<i64> {
        Ok(self
            .query_scalar(ctx, &self.statements.current_revision, &[], "id")?
            .unwrap_or(0))
    }

    /// Versions under `prefix` newer than `revision` in revision order, tombstones included.
    /// A positive `limit` caps the page; callers continue from the last returned id.
    pub fn after(
        &self,
        ctx: &Context,
        prefix: &str,
        revision: i64,
        limit: i64,
    ) -> StorageResult<Listing> {
        let sql = with_limit(&self.statements.after, limit);
        let rows = self.query(ctx, &sql, &[like_prefix(prefix), revision.into()])?;
        Listing::from_rows(rows)
    }

    /// Recorded compaction floor, 0 before the first compaction.
    pub fn get_compact_revision(&self, ctx: &Context) -> StorageResult<i64> {
        Ok(self
            .query_scalar(ctx, &self.statements.compact_revision, &[], "prev_revision")?
            .unwrap_or(0))
    }

    /// Records `revision` as the compaction floor, creating the sentinel row on first use.
    ///
    /// Update and insert are separate statements; concurrent callers can end up with two
    /// sentinel rows, so compaction should be driven from a single place.
    pub fn set_compact_revision(&self, ctx: &Context, revision: i64) -> StorageResult<()> {
        let result = self.execute(ctx, &self.statements.update_compact, &[revision.into()])?;
        if result.rows_affected != 0 {
            return Ok(());
        }

        let id = self.insert(ctx, COMPACT_REV_KEY, false, false, 0, revision, 0, b"", None)?;
        debug!("Created compaction sentinel at revision {} with floor {}", id, revision);
        Ok(())
    }
}

fn first_i64(rows: &[Vec<SqlValue>], column: &str) -> StorageResult<Option<i64>> {
    match rows.first().and_then(|row| row.first()) {
        Some(value) => Ok(Some(value.as_i64(column)?)),
        None => Ok(None),
    }
}

/// LIKE pattern matching keys that start with `prefix`, with `%`, `_` and the escape
/// character itself matched literally.
fn like_prefix(prefix: &str) -> SqlValue {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    SqlValue::Text(pattern)
}
