//! Statement adapter: the single path through which migrations touch the
//! database.
//!
//! Forward and backward procedures receive a [`StatementAdapter`] and hand it
//! either literal SQL or a [`SqlFragment`] tree. Fragments are flattened
//! depth-first into one SQL string with parameter values rendered inline,
//! then executed as a batch on the underlying connection.

use rusqlite::Connection;
use thiserror::Error;

/// Errors from the statement adapter.
#[derive(Debug, Error)]
pub enum StatementError {
    /// The input could not be flattened into an executable statement.
    #[error("Query format error: {0}")]
    QueryFormat(#[from] QueryFormatError),

    /// The flattened SQL failed to execute.
    #[error("SQL execution failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// The input was not a recognized query shape.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryFormatError {
    /// The fragment tree flattened to an empty statement.
    #[error("Query fragment flattened to an empty statement")]
    Empty,
}

/// A parameter value rendered inline into the flattened SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    /// Renders the value as inline SQL text.
    ///
    /// Text values are single-quoted with embedded quotes doubled.
    fn render(&self, out: &mut String) {
        match self {
            SqlValue::Null => out.push_str("NULL"),
            SqlValue::Integer(i) => out.push_str(&i.to_string()),
            SqlValue::Real(r) => out.push_str(&r.to_string()),
            SqlValue::Text(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

#[derive(Debug, Clone)]
enum SqlPiece {
    Text(String),
    Param(SqlValue),
    Nested(SqlFragment),
}

/// A structured query fragment: an ordered tree of literal SQL chunks,
/// inline parameters, and nested sub-fragments.
#[derive(Debug, Clone, Default)]
pub struct SqlFragment {
    pieces: Vec<SqlPiece>,
}

impl SqlFragment {
    /// Creates an empty fragment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a literal SQL chunk.
    pub fn text(mut self, sql: impl Into<String>) -> Self {
        self.pieces.push(SqlPiece::Text(sql.into()));
        self
    }

    /// Appends a parameter value, rendered inline at this position.
    pub fn param(mut self, value: impl Into<SqlValue>) -> Self {
        self.pieces.push(SqlPiece::Param(value.into()));
        self
    }

    /// Appends a nested sub-fragment, flattened in place.
    pub fn nested(mut self, fragment: SqlFragment) -> Self {
        self.pieces.push(SqlPiece::Nested(fragment));
        self
    }

    /// Flattens the tree depth-first into a single SQL string.
    pub fn flatten(&self) -> Result<String, QueryFormatError> {
        let mut out = String::new();
        self.flatten_into(&mut out);
        if out.trim().is_empty() {
            return Err(QueryFormatError::Empty);
        }
        Ok(out)
    }

    fn flatten_into(&self, out: &mut String) {
        for piece in &self.pieces {
            match piece {
                SqlPiece::Text(sql) => out.push_str(sql),
                SqlPiece::Param(value) => value.render(out),
                SqlPiece::Nested(fragment) => fragment.flatten_into(out),
            }
        }
    }
}

/// Query input accepted by [`StatementAdapter::execute`]: either literal SQL
/// or a structured fragment.
#[derive(Debug, Clone)]
pub enum Query {
    Sql(String),
    Fragment(SqlFragment),
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::Sql(sql.to_string())
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::Sql(sql)
    }
}

impl From<SqlFragment> for Query {
    fn from(fragment: SqlFragment) -> Self {
        Query::Fragment(fragment)
    }
}

/// Executes migration statements against a borrowed connection.
pub struct StatementAdapter<'conn> {
    conn: &'conn Connection,
}

impl<'conn> StatementAdapter<'conn> {
    /// Wraps a connection for statement execution.
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Flattens the input to one SQL string and executes it as a batch.
    ///
    /// Multiple `;`-separated statements are allowed, so a forward procedure
    /// can ship its whole DDL in one call. Statements before a failing one
    /// stay committed; SQLite applies no implicit savepoint across a batch.
    pub fn execute(&self, query: impl Into<Query>) -> Result<(), StatementError> {
        let sql = match query.into() {
            Query::Sql(sql) => {
                if sql.trim().is_empty() {
                    return Err(QueryFormatError::Empty.into());
                }
                sql
            }
            Query::Fragment(fragment) => fragment.flatten()?,
        };
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// Returns the underlying connection for read-only introspection.
    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_concatenates_literal_chunks() {
        let fragment = SqlFragment::new()
            .text("SELECT * FROM stocks")
            .text(" WHERE market = ")
            .param("SH");
        assert_eq!(
            fragment.flatten().unwrap(),
            "SELECT * FROM stocks WHERE market = 'SH'"
        );
    }

    #[test]
    fn flatten_is_depth_first_through_nested_fragments() {
        let inner = SqlFragment::new().text("volume > ").param(1000_i64);
        let fragment = SqlFragment::new()
            .text("SELECT symbol FROM stock_daily WHERE ")
            .nested(inner)
            .text(" AND close > ")
            .param(3.14_f64);
        assert_eq!(
            fragment.flatten().unwrap(),
            "SELECT symbol FROM stock_daily WHERE volume > 1000 AND close > 3.14"
        );
    }

    #[test]
    fn text_params_escape_single_quotes() {
        let fragment = SqlFragment::new().text("SELECT ").param("O'Hare");
        assert_eq!(fragment.flatten().unwrap(), "SELECT 'O''Hare'");
    }

    #[test]
    fn null_param_renders_as_null_keyword() {
        let fragment = SqlFragment::new().text("SELECT ").param(SqlValue::Null);
        assert_eq!(fragment.flatten().unwrap(), "SELECT NULL");
    }

    #[test]
    fn empty_fragment_is_a_format_error() {
        assert_eq!(
            SqlFragment::new().flatten().unwrap_err(),
            QueryFormatError::Empty
        );
    }

    #[test]
    fn execute_rejects_blank_sql() {
        let conn = Connection::open_in_memory().unwrap();
        let adapter = StatementAdapter::new(&conn);
        let err = adapter.execute("   ").unwrap_err();
        assert!(matches!(
            err,
            StatementError::QueryFormat(QueryFormatError::Empty)
        ));
    }

    #[test]
    fn execute_runs_multi_statement_batches() {
        let conn = Connection::open_in_memory().unwrap();
        let adapter = StatementAdapter::new(&conn);
        adapter
            .execute(
                "CREATE TABLE stocks (symbol TEXT PRIMARY KEY);
                 INSERT INTO stocks VALUES ('600519');",
            )
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM stocks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn execute_accepts_fragments() {
        let conn = Connection::open_in_memory().unwrap();
        let adapter = StatementAdapter::new(&conn);
        let fragment = SqlFragment::new()
            .text("CREATE TABLE watchlist (symbol TEXT, added_at INTEGER DEFAULT ")
            .param(0_i64)
            .text(")");
        adapter.execute(fragment).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='watchlist')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(exists);
    }
}
