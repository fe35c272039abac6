//! Placeholder rewriting for the SQL dialects the engine speaks.
//!
//! Statement templates are written once with unnumbered `?` markers. Drivers differ in what
//! they accept: SQLite and MySQL take `?`, PostgreSQL wants `$1..$n`. Rather than keeping a
//! copy of every statement per database, the difference is described as data (a marker string
//! and a numbering flag) and applied when the engine is opened.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bind-parameter style of a SQL driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialect {
    /// Marker emitted for each placeholder, e.g. `?` or `$`.
    pub param: String,

    /// Append the 1-based position of the placeholder to the marker.
    pub numbered: bool,
}

impl Dialect {
    pub fn new(param: impl Into<String>, numbered: bool) -> Self {
        Self {
            param: param.into(),
            numbered,
        }
    }

    pub fn sqlite() -> Self {
        Self::new("?", false)
    }

    pub fn postgres() -> Self {
        Self::new("$", true)
    }

    pub fn mysql() -> Self {
        Self::new("?", false)
    }

    /// Rewrites `sql` into this dialect's placeholder syntax.
    pub fn rewrite(&self, sql: &str) -> String {
        rewrite(sql, &self.param, self.numbered)
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Self::sqlite()
    }
}

/// Replaces every `?` in `sql` with `param`, numbering occurrences left to right from 1 when
/// `numbered` is set.
pub fn rewrite(sql: &str, param: &str, numbered: bool) -> String {
    if param == "?" && !numbered {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 16);
    let mut n = 0;
    for ch in sql.chars() {
        if ch != '?' {
            out.push(ch);
            continue;
        }
        out.push_str(param);
        if numbered {
            n += 1;
            out.push_str(&n.to_string());
        }
    }
    out
}

/// SQL collapsed onto one line for log output.
pub struct Stripped<'a>(pub &'a str);

impl fmt::Display for Stripped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut words = self.0.split_whitespace();
        if let Some(first) = words.next() {
            f.write_str(first)?;
            for word in words {
                f.write_str(" ")?;
                f.write_str(word)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unnumbered_question_mark_is_identity() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(rewrite(sql, "?", false), sql);
    }

    #[test]
    fn test_numbered_markers() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ? OR c = ?";
        assert_eq!(
            rewrite(sql, "$", true),
            "SELECT * FROM t WHERE a = $1 AND b = $2 OR c = $3"
        );
    }

    #[test]
    fn test_unnumbered_custom_marker() {
        assert_eq!(rewrite("a = ? AND b = ?", ":p", false), "a = :p AND b = :p");
    }

    #[test]
    fn test_numbered_question_mark() {
        assert_eq!(rewrite("a = ? AND b = ?", "?", true), "a = ?1 AND b = ?2");
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(rewrite("SELECT 1", "$", true), "SELECT 1");
    }

    #[test]
    fn test_presets() {
        assert_eq!(Dialect::postgres().rewrite("x = ?"), "x = $1");
        assert_eq!(Dialect::mysql().rewrite("x = ?"), "x = ?");
        assert_eq!(Dialect::default(), Dialect::sqlite());
    }

    #[test]
    fn test_stripped() {
        let sql = "\n\t\tSELECT a,\n\t\t  b\n\tFROM   t ";
        assert_eq!(Stripped(sql).to_string(), "SELECT a, b FROM t");
    }
}
