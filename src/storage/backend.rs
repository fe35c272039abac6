//! The database seam the engine runs its statements through.
//!
//! The engine only needs two primitives: run a statement and collect its rows, or run a
//! statement and learn how many rows it touched plus the last generated id. `Database`
//! captures exactly that so the engine never sees driver types. `SqliteDatabase` is the
//! bundled implementation, built on rusqlite.
//!
//! Cancellation is cooperative with the driver: while a statement runs, SQLite's progress
//! handler polls the caller's `Context` and interrupts the statement once it is done.
//! Only the connection running that statement is affected.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::storage::schema::SQLITE_SCHEMA;
use crate::storage::{Context, StorageError, StorageResult};

/// Number of SQLite VM instructions between cancellation checks.
const PROGRESS_OPS: i32 = 1000;

/// A bind argument or result column.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Integer column; NULL reads as 0 so empty aggregates need no special case.
    pub fn as_i64(&self, column: &str) -> StorageResult<i64> {
        match self {
            SqlValue::Null => Ok(0),
            SqlValue::Integer(v) => Ok(*v),
            other => Err(unexpected(column, "integer", other)),
        }
    }

    pub fn as_bool(&self, column: &str) -> StorageResult<bool> {
        Ok(self.as_i64(column)? != 0)
    }

    pub fn into_text(self, column: &str) -> StorageResult<String> {
        match self {
            SqlValue::Text(s) => Ok(s),
            SqlValue::Blob(b) => String::from_utf8(b)
                .map_err(|e| StorageError::Decode(format!("column {}: {}", column, e))),
            other => Err(unexpected(column, "text", &other)),
        }
    }

    pub fn into_blob(self, column: &str) -> StorageResult<Option<Vec<u8>>> {
        match self {
            SqlValue::Null => Ok(None),
            SqlValue::Blob(b) => Ok(Some(b)),
            SqlValue::Text(s) => Ok(Some(s.into_bytes())),
            other => Err(unexpected(column, "blob", &other)),
        }
    }
}

fn unexpected(column: &str, wanted: &str, got: &SqlValue) -> StorageError {
    StorageError::Decode(format!("column {}: expected {}, got {:?}", column, wanted, got))
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl From<Option<&[u8]>> for SqlValue {
    fn from(v: Option<&[u8]>) -> Self {
        v.map_or(SqlValue::Null, SqlValue::from)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,

    /// Id generated by the most recent insert on the connection that ran the statement.
    pub last_insert_id: i64,
}

/// A SQL database the engine can run its statements against.
pub trait Database: Send + Sync {
    /// Runs `sql` and returns every result row as a vector of columns.
    fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> StorageResult<Vec<Vec<SqlValue>>>;

    /// Runs a row-returning statement that also writes, such as `INSERT ... RETURNING`.
    ///
    /// Implementations that keep separate read connections run this on the write path.
    fn query_write(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> StorageResult<Vec<Vec<SqlValue>>> {
        self.query(ctx, sql, args)
    }

    /// Runs `sql` for its side effects.
    fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> StorageResult<ExecResult>;

    /// Creates the table and indexes if they do not exist yet.
    fn bootstrap(&self, ctx: &Context) -> StorageResult<()>;
}

/// SQLite-backed `Database`.
///
/// File databases run in WAL mode with one write connection and a pool of read-only
/// connections, so a slow read never holds up writers or other readers. An in-memory
/// database is private to its connection and runs everything on the writer.
pub struct SqliteDatabase {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    read_cursor: AtomicUsize,
}

impl SqliteDatabase {
    /// Opens `data_source` (a path, `file:` URI, or `:memory:`) with `read_pool_size`
    /// read connections.
    pub fn open(
        data_source: &str,
        busy_timeout: Duration,
        read_pool_size: usize,
    ) -> StorageResult<Self> {
        debug!("Opening SQLite database at {:?}", data_source);

        let in_memory = data_source.is_empty() || data_source == ":memory:";
        let writer = if in_memory {
            Connection::open_in_memory()?
        } else {
            Connection::open(data_source)?
        };
        apply_pragmas(&writer, busy_timeout)?;

        let mut readers = Vec::new();
        if !in_memory {
            let mode: String =
                writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!("SQLite journal mode {}", mode);

            let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            for _ in 0..read_pool_size {
                let reader = Connection::open_with_flags(data_source, flags)?;
                apply_pragmas(&reader, busy_timeout)?;
                readers.push(Mutex::new(reader));
            }
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            read_cursor: AtomicUsize::new(0),
        })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:", Duration::from_secs(5), 0)
    }

    /// Number of read-only connections; zero means reads share the writer.
    pub fn read_pool_size(&self) -> usize {
        self.readers.len()
    }

    /// Picks an idle reader, starting from the round-robin cursor, and waits on the
    /// cursor's reader when all are busy.
    fn read_connection(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }

        let n = self.readers.len();
        let start = self.read_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            if let Some(conn) = self.readers[(start + offset) % n].try_lock() {
                return conn;
            }
        }
        self.readers[start % n].lock()
    }
}

fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // LIKE must be byte-exact for prefix matching.
    conn.execute_batch("PRAGMA case_sensitive_like = ON;")
}

/// Runs `f` on `conn` with `ctx` wired to SQLite's interrupt mechanism.
fn interruptible<T>(
    ctx: &Context,
    conn: &Connection,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> StorageResult<T> {
    ctx.check()?;

    let watcher = AssertUnwindSafe(ctx.clone());
    conn.progress_handler(PROGRESS_OPS, Some(move || watcher.is_done()));
    let result = f(conn);
    conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);

    result.map_err(|err| match ctx.err() {
        Some(cancelled) if is_interrupt(&err) => cancelled,
        _ => StorageError::Database(err),
    })
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::OperationInterrupted
    )
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    args: &[SqlValue],
) -> rusqlite::Result<Vec<Vec<SqlValue>>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let width = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(args.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(width);
        for i in 0..width {
            columns.push(SqlValue::from(row.get_ref(i)?));
        }
        out.push(columns);
    }
    Ok(out)
}

impl Database for SqliteDatabase {
    fn query(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> StorageResult<Vec<Vec<SqlValue>>> {
        let conn = self.read_connection();
        interruptible(ctx, &conn, |conn| collect_rows(conn, sql, args))
    }

    fn query_write(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[SqlValue],
    ) -> StorageResult<Vec<Vec<SqlValue>>> {
        let conn = self.writer.lock();
        interruptible(ctx, &conn, |conn| collect_rows(conn, sql, args))
    }

    fn execute(&self, ctx: &Context, sql: &str, args: &[SqlValue]) -> StorageResult<ExecResult> {
        let conn = self.writer.lock();
        interruptible(ctx, &conn, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows_affected = stmt.execute(params_from_iter(args.iter()))?;
            Ok(ExecResult {
                rows_affected: rows_affected as u64,
                last_insert_id: conn.last_insert_rowid(),
            })
        })
    }

    fn bootstrap(&self, ctx: &Context) -> StorageResult<()> {
        debug!("Bootstrapping key_value schema");
        let conn = self.writer.lock();
        interruptible(ctx, &conn, |conn| {
            for ddl in SQLITE_SCHEMA {
                conn.execute(ddl, [])?;
            }
            Ok(())
        })
    }
}
