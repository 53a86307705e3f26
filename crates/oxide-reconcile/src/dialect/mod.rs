//! Database dialect implementations.
//!
//! A dialect knows how to turn a [`MigrationStep`] into the SQL statements
//! that carry it out.

mod sqlite;

pub use sqlite::SqliteDialect;

use crate::schema::{ColumnDescriptor, SqlType};
use crate::step::MigrationStep;

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Generates the statements for a migration step, in execution order.
    fn generate_sql(&self, step: &MigrationStep) -> Vec<String>;

    /// Returns the SQL type name for the given type.
    fn type_name(&self, sql_type: &SqlType) -> String;

    /// Returns the auto-increment keyword for this dialect.
    fn auto_increment_keyword(&self) -> &'static str;

    /// Generates column definition SQL.
    ///
    /// `inline_primary_key` is set when the table has a single-column primary
    /// key declared on this column.
    fn column_definition(&self, column: &ColumnDescriptor, inline_primary_key: bool) -> String {
        let mut parts = vec![self.quote_identifier(&column.name)];

        let type_name = self.type_name(&column.sql_type);
        if !type_name.is_empty() {
            parts.push(type_name);
        }

        if inline_primary_key {
            parts.push("PRIMARY KEY".to_string());
            if column.auto_increment {
                parts.push(self.auto_increment_keyword().to_string());
            }
        }

        // INTEGER PRIMARY KEY aliases the rowid and can never hold NULL;
        // other primary keys accept NULL unless told otherwise.
        if !column.nullable && !(inline_primary_key && column.sql_type.is_integer()) {
            parts.push("NOT NULL".to_string());
        }

        if let Some(default_sql) = column.default.to_sql() {
            parts.push(format!("DEFAULT {}", default_sql));
        }

        if let Some(ref collation) = column.collation {
            parts.push(format!("COLLATE {}", collation));
        }

        parts.join(" ")
    }

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}
