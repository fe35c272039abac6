//! SQL statements, rendered once per engine.
//!
//! Every read that returns records has the same shape: for each key under a prefix, join
//! the key's rows to the single row with the largest id that satisfies the bound, then drop
//! tombstones unless asked not to. The bound is expressed as an extra predicate spliced into
//! the per-key `MAX(id)` subquery, which gives list-current (no predicate), list-at-revision
//! (`id <= ?`) and list-after-key (`id <= ?` and greater than the id of a given key).
//!
//! Record-returning statements lead with two extra columns: the global current revision and
//! the compaction floor, read by the same statement as the rows themselves.

use std::borrow::Cow;

use crate::storage::schema::COLUMNS;
use crate::storage::Dialect;

/// Escape character for prefix patterns. Plain in every supported dialect's literals.
pub const LIKE_ESCAPE: char = '!';

/// Global high-water mark.
pub const REVISION_SQL: &str = "
    SELECT rkv.id
    FROM key_value rkv
    ORDER BY rkv.id
    DESC LIMIT 1";

/// Floor recorded on the most recent sentinel row.
pub const COMPACT_REVISION_SQL: &str = "
    SELECT crkv.prev_revision
    FROM key_value crkv
    WHERE crkv.name = 'compact_rev_key'
    ORDER BY crkv.id DESC LIMIT 1";

/// Bound for continuing a listing after `start_key` as of a revision.
/// Arguments: revision, start_key, revision.
const AFTER_KEY_PREDICATE: &str = "
    AND mkv.id <= ? AND mkv.id > (
        SELECT ikv.id
        FROM key_value ikv
        WHERE
            ikv.name = ? AND
            ikv.id <= ?
        ORDER BY ikv.id DESC LIMIT 1)";

const INSERT_INTO: &str = "
    INSERT INTO key_value(
        name, created, deleted, create_revision, prev_revision, lease, value, old_value)";

/// Per-key latest-row listing with `predicate` spliced into the `MAX(id)` subquery.
/// Arguments: prefix pattern, predicate arguments, include_deleted.
fn list_sql(predicate: &str) -> String {
    format!(
        "
        SELECT ({rev}), ({compact}), {columns}
        FROM key_value kv
        JOIN (
            SELECT MAX(mkv.id) AS id
            FROM key_value mkv
            WHERE
                mkv.name LIKE ? ESCAPE '{escape}'
                {predicate}
            GROUP BY mkv.name) maxkv
        ON maxkv.id = kv.id
        WHERE
            (kv.deleted = 0 OR ?)
        ORDER BY kv.id ASC
        ",
        rev = REVISION_SQL,
        compact = COMPACT_REVISION_SQL,
        columns = COLUMNS,
        escape = LIKE_ESCAPE,
        predicate = predicate,
    )
}

/// The engine's statements in the target dialect.
#[derive(Clone, Debug)]
pub struct Statements {
    pub current_revision: String,
    pub compact_revision: String,
    pub get_revision: String,
    pub list_current: String,
    pub list_revision_start: String,
    pub list_revision_after: String,
    pub count: String,
    pub after: String,
    pub delete: String,
    pub update_compact: String,
    pub insert: String,
    pub insert_returning: String,
}

impl Statements {
    pub fn new(dialect: &Dialect) -> Self {
        let q = |sql: &str| dialect.rewrite(sql);

        Self {
            current_revision: q(REVISION_SQL),
            compact_revision: q(COMPACT_REVISION_SQL),

            get_revision: q(&format!(
                "
                SELECT 0, 0, {}
                FROM key_value kv
                WHERE kv.id = ?",
                COLUMNS
            )),

            list_current: q(&list_sql("")),
            list_revision_start: q(&list_sql("AND mkv.id <= ?")),
            list_revision_after: q(&list_sql(AFTER_KEY_PREDICATE)),

            count: q(&format!(
                "
                SELECT ({}), COUNT(c.theid)
                FROM (
                    {}
                ) c",
                REVISION_SQL,
                list_sql("")
            )),

            after: q(&format!(
                "
                SELECT ({}), ({}), {}
                FROM key_value kv
                WHERE
                    kv.name LIKE ? ESCAPE '{}' AND
                    kv.id > ?
                ORDER BY kv.id ASC",
                REVISION_SQL, COMPACT_REVISION_SQL, COLUMNS, LIKE_ESCAPE
            )),

            delete: q("
                DELETE FROM key_value
                WHERE id = ?"),

            update_compact: q("
                UPDATE key_value
                SET prev_revision = ?
                WHERE name = 'compact_rev_key'"),

            insert: q(&format!("{} VALUES(?, ?, ?, ?, ?, ?, ?, ?)", INSERT_INTO)),

            insert_returning: q(&format!(
                "{} VALUES(?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                INSERT_INTO
            )),
        }
    }
}

/// Appends `LIMIT n` for a positive `limit`; anything else means unbounded.
pub fn with_limit(sql: &str, limit: i64) -> Cow<'_, str> {
    if limit > 0 {
        Cow::Owned(format!("{} LIMIT {}", sql, limit))
    } else {
        Cow::Borrowed(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dialect::Stripped;

    fn placeholders(sql: &str) -> usize {
        sql.matches('?').count()
    }

    #[test]
    fn test_argument_counts() {
        let s = Statements::new(&Dialect::sqlite());
        assert_eq!(placeholders(&s.current_revision), 0);
        assert_eq!(placeholders(&s.compact_revision), 0);
        assert_eq!(placeholders(&s.get_revision), 1);
        assert_eq!(placeholders(&s.list_current), 2);
        assert_eq!(placeholders(&s.list_revision_start), 3);
        assert_eq!(placeholders(&s.list_revision_after), 5);
        assert_eq!(placeholders(&s.count), 2);
        assert_eq!(placeholders(&s.after), 2);
        assert_eq!(placeholders(&s.delete), 1);
        assert_eq!(placeholders(&s.update_compact), 1);
        assert_eq!(placeholders(&s.insert), 8);
        assert_eq!(placeholders(&s.insert_returning), 8);
    }

    #[test]
    fn test_postgres_numbering() {
        let s = Statements::new(&Dialect::postgres());
        assert!(!s.list_revision_after.contains('?'));
        for n in 1..=5 {
            assert!(s.list_revision_after.contains(&format!("${}", n)));
        }
        assert!(!s.list_revision_after.contains("$6"));
        assert!(Stripped(&s.insert_returning)
            .to_string()
            .ends_with("VALUES($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id"));
    }

    #[test]
    fn test_only_returning_variant_returns() {
        let s = Statements::new(&Dialect::mysql());
        assert!(s.insert_returning.contains("RETURNING id"));
        assert!(!s.insert.contains("RETURNING"));
    }

    #[test]
    fn test_prefix_patterns_declare_their_escape() {
        let s = Statements::new(&Dialect::postgres());
        for sql in [&s.list_current, &s.list_revision_start, &s.list_revision_after, &s.after] {
            assert!(sql.contains("LIKE $1 ESCAPE '!'"), "{}", Stripped(sql));
        }
        assert!(s.count.contains("ESCAPE '!'"));
    }

    #[test]
    fn test_with_limit() {
        assert_eq!(with_limit("SELECT 1", 0), "SELECT 1");
        assert_eq!(with_limit("SELECT 1", -3), "SELECT 1");
        assert_eq!(with_limit("SELECT 1", 10), "SELECT 1 LIMIT 10");
    }
}
