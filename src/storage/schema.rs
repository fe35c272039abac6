//! Table layout and the `Record` row type.
//!
//! One row per historical version of one key:
//!
//! | column          | meaning                                                        |
//! |-----------------|----------------------------------------------------------------|
//! | id              | revision at which this version became visible (db-assigned)    |
//! | name            | the key                                                        |
//! | created         | first version of this key's lineage                            |
//! | deleted         | tombstone                                                      |
//! | create_revision | id of the version that created the lineage (0 if unknown)      |
//! | prev_revision   | id of the preceding version; compaction floor on the sentinel  |
//! | lease           | caller-supplied lease token                                    |
//! | value           | payload, empty for tombstones                                  |
//! | old_value       | payload of the previous version, nullable                      |
//!
//! Rows are only appended and deleted. The one exception is the compaction sentinel, whose
//! `prev_revision` is updated in place.

use crate::storage::{SqlValue, StorageError, StorageResult};

/// Name of the sentinel row holding the compaction floor in `prev_revision`.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Projection shared by every row-returning statement, in `Record` field order.
pub const COLUMNS: &str = "kv.id AS theid, kv.name, kv.created, kv.deleted, kv.create_revision, \
                           kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// Number of columns in [`COLUMNS`].
pub const COLUMN_COUNT: usize = 9;

/// SQLite DDL. Ids use AUTOINCREMENT so a revision is never handed out twice, even after
/// the row holding the highest id has been deleted.
pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS key_value (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created INTEGER NOT NULL,
        deleted INTEGER NOT NULL,
        create_revision INTEGER NOT NULL,
        prev_revision INTEGER NOT NULL,
        lease INTEGER NOT NULL,
        value BLOB,
        old_value BLOB
    )",
    "CREATE INDEX IF NOT EXISTS key_value_name_index ON key_value (name)",
    "CREATE INDEX IF NOT EXISTS key_value_name_id_index ON key_value (name, id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS key_value_name_prev_revision_uindex \
        ON key_value (name, prev_revision)",
];

/// One version of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    /// Revision of this version
    pub id: i64,

    /// The key
    pub name: String,

    /// First version of the key's lineage
    pub created: bool,

    /// Tombstone
    pub deleted: bool,

    /// Revision that created the key's current lineage
    pub create_revision: i64,

    /// Revision of the preceding version
    pub prev_revision: i64,

    /// Lease token (0 if none)
    pub lease: i64,

    /// Current payload
    pub value: Vec<u8>,

    /// Payload of the preceding version
    pub old_value: Option<Vec<u8>>,
}

impl Record {
    /// Decodes a record from the [`COLUMNS`] projection.
    pub fn from_columns(columns: Vec<SqlValue>) -> StorageResult<Self> {
        if columns.len() != COLUMN_COUNT {
            return Err(StorageError::Decode(format!(
                "expected {} record columns, got {}",
                COLUMN_COUNT,
                columns.len()
            )));
        }

        let mut it = columns.into_iter();
        // The length check above guarantees nine items.
        let mut next = || it.next().unwrap_or(SqlValue::Null);

        Ok(Record {
            id: next().as_i64("id")?,
            name: next().into_text("name")?,
            created: next().as_bool("created")?,
            deleted: next().as_bool("deleted")?,
            create_revision: next().as_i64("create_revision")?,
            prev_revision: next().as_i64("prev_revision")?,
            lease: next().as_i64("lease")?,
            value: next().into_blob("value")?.unwrap_or_default(),
            old_value: next().into_blob("old_value")?,
        })
    }

    /// True for the compaction sentinel row.
    pub fn is_compaction_sentinel(&self) -> bool {
        self.name == COMPACT_REV_KEY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<SqlValue> {
        vec![
            SqlValue::Integer(7),
            SqlValue::Text("/registry/pods/a".to_string()),
            SqlValue::Integer(1),
            SqlValue::Integer(0),
            SqlValue::Integer(0),
            SqlValue::Integer(3),
            SqlValue::Integer(60),
            SqlValue::Blob(b"v2".to_vec()),
            SqlValue::Blob(b"v1".to_vec()),
        ]
    }

    #[test]
    fn test_decode_record() {
        let record = Record::from_columns(columns()).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.name, "/registry/pods/a");
        assert!(record.created);
        assert!(!record.deleted);
        assert_eq!(record.prev_revision, 3);
        assert_eq!(record.lease, 60);
        assert_eq!(record.value, b"v2");
        assert_eq!(record.old_value, Some(b"v1".to_vec()));
        assert!(!record.is_compaction_sentinel());
    }

    #[test]
    fn test_decode_null_payloads() {
        let mut cols = columns();
        cols[7] = SqlValue::Null;
        cols[8] = SqlValue::Null;
        let record = Record::from_columns(cols).unwrap();
        assert!(record.value.is_empty());
        assert_eq!(record.old_value, None);
    }

    #[test]
    fn test_decode_wrong_arity() {
        let err = Record::from_columns(vec![SqlValue::Integer(1)]).unwrap_err();
        assert!(matches!(err, StorageError::Decode(_)));
    }

    #[test]
    fn test_decode_wrong_type() {
        let mut cols = columns();
        cols[0] = SqlValue::Blob(vec![1]);
        assert!(matches!(
            Record::from_columns(cols),
            Err(StorageError::Decode(_))
        ));
    }
}
