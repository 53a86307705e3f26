//! Live schema introspection.
//!
//! Reads SQLite's catalog and rebuilds [`TableDescriptor`]s in the same shape
//! used for declared schemas. Column collations and `AUTOINCREMENT` are not
//! reported by any pragma, so they are recovered from the `CREATE TABLE`
//! text stored in `sqlite_master`.

use std::collections::{BTreeMap, HashMap};

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::error::Result;
use crate::schema::{
    ColumnDescriptor, DefaultValue, ForeignKeyAction, ForeignKeyDescriptor, IndexDescriptor,
    SqlType, TableDescriptor,
};
use crate::store::DEFAULT_STORE_TABLE;

/// Reads table descriptors from a live database.
#[derive(Debug, Clone)]
pub struct SchemaInspector {
    excluded: Vec<String>,
}

impl Default for SchemaInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaInspector {
    /// Creates an inspector that hides the default bookkeeping table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            excluded: vec![DEFAULT_STORE_TABLE.to_string()],
        }
    }

    /// Creates an inspector that hides the given tables.
    #[must_use]
    pub fn excluding<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: tables.into_iter().map(Into::into).collect(),
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|t| t.eq_ignore_ascii_case(name))
    }

    /// Reads every user table, keyed by name.
    pub async fn inspect(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<BTreeMap<String, TableDescriptor>> {
        let tables: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT name, sql FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut schema = BTreeMap::new();
        for (name, sql) in tables {
            if self.is_excluded(&name) {
                continue;
            }
            let table = self.inspect_table(conn, &name, sql.as_deref()).await?;
            debug!(table = %name, columns = table.columns.len(), "Inspected table");
            schema.insert(name, table);
        }
        Ok(schema)
    }

    async fn inspect_table(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        create_sql: Option<&str>,
    ) -> Result<TableDescriptor> {
        let clauses = create_sql.map(column_clauses).unwrap_or_default();

        let rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
            "SELECT name, type, \"notnull\", dflt_value, pk \
             FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(name)
        .fetch_all(&mut *conn)
        .await?;

        let mut table = TableDescriptor::new(name);
        for (column, declared_type, not_null, default, pk) in rows {
            let extra = clauses
                .get(&column.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default();
            table.columns.push(ColumnDescriptor {
                sql_type: SqlType::from_declared(&declared_type),
                nullable: not_null == 0 && pk == 0,
                default: default
                    .as_deref()
                    .map(DefaultValue::from_sql)
                    .unwrap_or_default(),
                primary_key: pk > 0,
                auto_increment: extra.auto_increment,
                collation: extra.collation,
                indexed: false,
                name: column,
            });
        }

        table.indices = self.inspect_indices(conn, name).await?;
        table.foreign_keys = self.inspect_foreign_keys(conn, name).await?;
        Ok(table)
    }

    async fn inspect_indices(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Vec<IndexDescriptor>> {
        let listed: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT name, \"unique\", origin FROM pragma_index_list(?) ORDER BY name",
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        let mut indices = Vec::new();
        // Only explicit CREATE INDEX statements; `pk` and `u` origins are
        // implied by the table definition itself.
        for (name, unique, origin) in listed.into_iter().filter(|(_, _, o)| o == "c") {
            let columns: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                    .bind(&name)
                    .fetch_all(&mut *conn)
                    .await?;
            if columns.iter().any(|(c,)| c.is_none()) {
                warn!(table = %table, index = %name, "Skipping expression index");
                continue;
            }
            indices.push(IndexDescriptor {
                name,
                columns: columns.into_iter().filter_map(|(c,)| c).collect(),
                unique: unique != 0,
            });
        }
        Ok(indices)
    }

    async fn inspect_foreign_keys(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
    ) -> Result<Vec<ForeignKeyDescriptor>> {
        let rows: Vec<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
             FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

        let mut by_id: BTreeMap<i64, Vec<ForeignKeyDescriptor>> = BTreeMap::new();
        for (id, references, from, to, on_update, on_delete) in rows {
            by_id.entry(id).or_default().push(ForeignKeyDescriptor {
                column: from,
                references_table: references,
                references_column: to.unwrap_or_default(),
                on_delete: ForeignKeyAction::from_sql(&on_delete),
                on_update: ForeignKeyAction::from_sql(&on_update),
            });
        }

        let mut foreign_keys = Vec::new();
        for (id, mut parts) in by_id {
            if parts.len() > 1 {
                warn!(table = %table, id, "Skipping multi-column foreign key");
                continue;
            }
            foreign_keys.extend(parts.pop());
        }
        foreign_keys.sort();
        Ok(foreign_keys)
    }
}

/// Column clauses recovered from a `CREATE TABLE` statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ColumnClauses {
    pub collation: Option<String>,
    pub auto_increment: bool,
}

/// Extracts per-column `COLLATE` and `AUTOINCREMENT` clauses, keyed by
/// lower-cased column name.
pub(crate) fn column_clauses(create_sql: &str) -> HashMap<String, ColumnClauses> {
    let mut clauses = HashMap::new();
    let (Some(open), Some(close)) = (create_sql.find('('), create_sql.rfind(')')) else {
        return clauses;
    };
    if close <= open {
        return clauses;
    }

    for definition in split_top_level(&create_sql[open + 1..close]) {
        let tokens = tokenize(definition);
        let first = match tokens.first() {
            Some(Token::Word(word)) if is_table_constraint(word) => continue,
            Some(Token::Word(name) | Token::Quoted(name)) => name,
            _ => continue,
        };

        let mut extra = ColumnClauses::default();
        let mut iter = tokens.iter().skip(1).peekable();
        while let Some(token) = iter.next() {
            if let Token::Word(word) = token {
                if word.eq_ignore_ascii_case("COLLATE") {
                    if let Some(Token::Word(name) | Token::Quoted(name)) = iter.peek() {
                        extra.collation = Some(name.to_ascii_uppercase());
                    }
                } else if word.eq_ignore_ascii_case("AUTOINCREMENT") {
                    extra.auto_increment = true;
                }
            }
        }
        clauses.insert(first.to_ascii_lowercase(), extra);
    }
    clauses
}

fn is_table_constraint(word: &str) -> bool {
    ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"]
        .iter()
        .any(|kw| word.eq_ignore_ascii_case(kw))
}

/// Splits a table body on commas that are not nested in parentheses or
/// quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, ch) in body.char_indices() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '[' => quote = Some(']'),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&body[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&body[start..]);
    parts
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Keyword or identifier, unquoted.
    Word(String),
    /// Identifier in double quotes, backticks or brackets.
    Quoted(String),
    /// String literal, parenthesised group or punctuation.
    Other,
}

fn tokenize(definition: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = definition.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '`' | '[' => {
                let close = if ch == '[' { ']' } else { ch };
                chars.next();
                let mut word = String::new();
                while let Some(c) = chars.next() {
                    if c == close {
                        // Doubled quote inside a quoted identifier
                        if close != ']' && chars.peek() == Some(&close) {
                            chars.next();
                            word.push(c);
                            continue;
                        }
                        break;
                    }
                    word.push(c);
                }
                tokens.push(Token::Quoted(word));
            }
            '\'' => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                tokens.push(Token::Other);
            }
            '(' => {
                chars.next();
                let mut depth = 1usize;
                for c in chars.by_ref() {
                    match c {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                tokens.push(Token::Other);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            _ => {
                chars.next();
                tokens.push(Token::Other);
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    async fn connect() -> SqliteConnection {
        SqliteConnection::connect(":memory:")
            .await
            .expect("Failed to open in-memory SQLite connection")
    }

    #[test]
    fn test_column_clauses() {
        let clauses = column_clauses(
            "CREATE TABLE \"users\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
             \"Email\" TEXT NOT NULL DEFAULT 'a,b' COLLATE nocase,\n  \
             price NUMERIC(10, 2),\n  UNIQUE (\"Email\")\n)",
        );

        assert!(clauses["id"].auto_increment);
        assert_eq!(clauses["email"].collation.as_deref(), Some("NOCASE"));
        assert_eq!(clauses["price"], ColumnClauses::default());
        assert!(!clauses.contains_key("unique"));
    }

    #[test]
    fn test_quoted_keyword_column_keeps_clauses() {
        let clauses = column_clauses(
            "CREATE TABLE \"t\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
             \"check\" TEXT COLLATE NOCASE,\n  [unique] TEXT COLLATE \"rtrim\",\n  \
             CHECK (length(\"check\") > 0)\n)",
        );

        assert_eq!(clauses["check"].collation.as_deref(), Some("NOCASE"));
        assert_eq!(clauses["unique"].collation.as_deref(), Some("RTRIM"));
        assert_eq!(clauses.len(), 3);
    }

    #[test]
    fn test_split_ignores_nested_commas() {
        let parts = split_top_level("a NUMERIC(10, 2), b TEXT DEFAULT ',', [c,d] INT");
        assert_eq!(parts.len(), 3);
        assert_eq!(tokenize(parts[2])[0], Token::Quoted("c,d".into()));
    }

    #[tokio::test]
    async fn test_inspect_reads_columns_indices_and_foreign_keys() {
        let mut conn = connect().await;
        for sql in [
            "CREATE TABLE authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL COLLATE NOCASE)",
            "CREATE TABLE books (id INTEGER PRIMARY KEY, author_id INTEGER NOT NULL DEFAULT 0, \
             title TEXT UNIQUE, FOREIGN KEY (author_id) REFERENCES authors (id) ON DELETE CASCADE)",
            "CREATE INDEX idx_books_author_id ON books (author_id)",
        ] {
            sqlx::query(sql).execute(&mut conn).await.unwrap();
        }

        let schema = SchemaInspector::new().inspect(&mut conn).await.unwrap();
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["authors", "books"]);

        let authors = &schema["authors"];
        assert!(authors.columns[0].primary_key);
        assert!(authors.columns[0].auto_increment);
        assert!(!authors.columns[0].nullable);
        assert_eq!(authors.columns[1].collation.as_deref(), Some("NOCASE"));

        let books = &schema["books"];
        assert_eq!(books.columns[1].default, DefaultValue::Integer(0));
        assert!(books.columns[2].nullable);
        // The UNIQUE constraint's autoindex is not reported as an index.
        assert_eq!(books.indices.len(), 1);
        assert_eq!(books.indices[0].name, "idx_books_author_id");
        assert_eq!(books.foreign_keys.len(), 1);
        assert_eq!(books.foreign_keys[0].references_table, "authors");
        assert_eq!(books.foreign_keys[0].on_delete, ForeignKeyAction::Cascade);
    }

    #[tokio::test]
    async fn test_inspect_keeps_tables_that_only_look_internal() {
        let mut conn = connect().await;
        sqlx::query("CREATE TABLE sqliteXcache (id INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE seq (id INTEGER PRIMARY KEY AUTOINCREMENT)")
            .execute(&mut conn)
            .await
            .unwrap();

        let schema = SchemaInspector::new().inspect(&mut conn).await.unwrap();
        // sqlite_sequence is internal and stays hidden.
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["seq", "sqliteXcache"]);
    }

    #[tokio::test]
    async fn test_inspect_excludes_bookkeeping_table() {
        let mut conn = connect().await;
        sqlx::query("CREATE TABLE kept (id INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE hidden (id INTEGER)")
            .execute(&mut conn)
            .await
            .unwrap();

        let schema = SchemaInspector::excluding(["hidden"])
            .inspect(&mut conn)
            .await
            .unwrap();
        assert_eq!(schema.keys().collect::<Vec<_>>(), vec!["kept"]);
    }
}
