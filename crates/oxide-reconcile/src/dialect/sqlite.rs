//! SQLite dialect for migrations.
//!
//! SQLite has limited ALTER TABLE support, so column removal, retyping and
//! constraint changes use the "table recreation" strategy: create a new
//! table, copy data, drop the old table, rename the new table.

use crate::schema::{ColumnDescriptor, IndexDescriptor, SqlType, TableDescriptor};
use crate::step::{ColumnMapping, MigrationStep};

use super::MigrationDialect;

/// SQLite migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generates SQL for creating `table`'s structure under `name`.
    pub fn create_table_sql(&self, name: &str, table: &TableDescriptor) -> String {
        let primary_key = table.primary_key();
        let inline_pk = primary_key.len() == 1;

        let mut defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| self.column_definition(c, inline_pk && c.primary_key))
            .collect();

        if primary_key.len() > 1 {
            let quoted: Vec<String> = primary_key
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect();
            defs.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }

        for fk in &table.foreign_keys {
            let mut def = format!(
                "FOREIGN KEY ({}) REFERENCES {}",
                self.quote_identifier(&fk.column),
                self.quote_identifier(&fk.references_table)
            );
            if !fk.references_column.is_empty() {
                def.push_str(&format!(" ({})", self.quote_identifier(&fk.references_column)));
            }
            def.push_str(&format!(" ON DELETE {}", fk.on_delete.to_sql()));
            def.push_str(&format!(" ON UPDATE {}", fk.on_update.to_sql()));
            defs.push(def);
        }

        format!(
            "CREATE TABLE {} (\n  {}\n)",
            self.quote_identifier(name),
            defs.join(",\n  ")
        )
    }

    /// Generates SQL for dropping a table.
    fn drop_table_sql(&self, name: &str) -> String {
        format!("DROP TABLE {}", self.quote_identifier(name))
    }

    /// Generates SQL for renaming a table.
    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL for adding a column.
    fn add_column_sql(&self, table: &str, column: &ColumnDescriptor) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column, false)
        )
    }

    /// Generates SQL for creating an index.
    fn create_index_sql(&self, table: &str, index: &IndexDescriptor) -> String {
        let mut sql = String::from("CREATE ");
        if index.unique {
            sql.push_str("UNIQUE ");
        }
        sql.push_str("INDEX ");
        sql.push_str(&self.quote_identifier(&index.resolved_name(table)));
        sql.push_str(" ON ");
        sql.push_str(&self.quote_identifier(table));
        sql.push_str(" (");

        let quoted: Vec<String> = index
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect();
        sql.push_str(&quoted.join(", "));
        sql.push(')');
        sql
    }

    /// Generates SQL for dropping an index.
    fn drop_index_sql(&self, name: &str) -> String {
        // SQLite index names are global, not per-table
        format!("DROP INDEX {}", self.quote_identifier(name))
    }

    /// Generates the row copy between two tables.
    ///
    /// Every row is carried over. When no column survives, only the rowid is
    /// copied and the new columns take their defaults.
    pub fn copy_rows_sql(&self, from: &str, to: &str, mapping: &ColumnMapping) -> String {
        if mapping.is_empty() {
            return format!(
                "INSERT INTO {} (rowid) SELECT rowid FROM {}",
                self.quote_identifier(to),
                self.quote_identifier(from)
            );
        }
        let targets: Vec<String> = mapping
            .new_columns()
            .map(|c| self.quote_identifier(c))
            .collect();
        let sources: Vec<String> = mapping
            .old_columns()
            .map(|c| self.quote_identifier(c))
            .collect();
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.quote_identifier(to),
            targets.join(", "),
            sources.join(", "),
            self.quote_identifier(from)
        )
    }

    /// Generates the statements that raise `to`'s `AUTOINCREMENT` counter to
    /// at least the one recorded for `from`.
    ///
    /// The entry for `from` disappears with its table, and the copy alone only
    /// advances `to` to the largest id copied.
    pub fn carry_sequence_sql(&self, from: &str, to: &str) -> Vec<String> {
        let from = quote_literal(from);
        let to = quote_literal(to);
        vec![
            format!(
                "UPDATE sqlite_sequence SET seq = MAX(seq, COALESCE(\
                 (SELECT seq FROM sqlite_sequence WHERE name = {from}), 0)) \
                 WHERE name = {to}"
            ),
            format!(
                "INSERT INTO sqlite_sequence (name, seq) \
                 SELECT {to}, seq FROM sqlite_sequence WHERE name = {from} \
                 AND NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = {to})"
            ),
        ]
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn generate_sql(&self, step: &MigrationStep) -> Vec<String> {
        match step {
            MigrationStep::CreateTable(table) => {
                vec![self.create_table_sql(&table.name, table)]
            }

            MigrationStep::DropTable(name) => vec![self.drop_table_sql(name)],

            MigrationStep::AddColumn { table, column } => {
                vec![self.add_column_sql(table, column)]
            }

            MigrationStep::RecreateTable {
                table,
                temp_table,
                new,
                mapping,
                ..
            } => {
                let mut statements = vec![
                    self.create_table_sql(temp_table, new),
                    self.copy_rows_sql(table, temp_table, mapping),
                ];
                if new.columns.iter().any(|c| c.auto_increment) {
                    statements.extend(self.carry_sequence_sql(table, temp_table));
                }
                statements.push(self.drop_table_sql(table));
                statements.push(self.rename_table_sql(temp_table, table));
                statements
            }

            MigrationStep::CreateIndex { table, index } => {
                vec![self.create_index_sql(table, index)]
            }

            MigrationStep::DropIndex { name, .. } => vec![self.drop_index_sql(name)],
        }
    }

    fn type_name(&self, sql_type: &SqlType) -> String {
        sql_type.sqlite_name().to_string()
    }

    fn auto_increment_keyword(&self) -> &'static str {
        "AUTOINCREMENT"
    }
}
