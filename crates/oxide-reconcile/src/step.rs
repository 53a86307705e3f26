//! Migration steps.
//!
//! A plan is an ordered list of [`MigrationStep`]s. Each step is one
//! structural change; steps are consumed in order by the executor and are not
//! kept once the run ends.

use std::fmt;

use serde::Serialize;

use crate::schema::{ColumnDescriptor, IndexDescriptor, TableDescriptor};

/// The kind of a migration step, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StepKind {
    /// Create a table.
    CreateTable,
    /// Drop a table.
    DropTable,
    /// Append a column.
    AddColumn,
    /// Rebuild a table through a temporary copy.
    RecreateTable,
    /// Create an index.
    CreateIndex,
    /// Drop an index.
    DropIndex,
}

impl StepKind {
    /// Returns the kind's name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTable => "CreateTable",
            Self::DropTable => "DropTable",
            Self::AddColumn => "AddColumn",
            Self::RecreateTable => "RecreateTable",
            Self::CreateIndex => "CreateIndex",
            Self::DropIndex => "DropIndex",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which old columns carry their data into which new columns.
///
/// Columns are matched by exact name. Old columns without a match are
/// dropped; new columns without a match get their default or NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    pairs: Vec<(String, String)>,
}

impl ColumnMapping {
    /// Maps every column of `new` that also exists in `old`, in `new`'s order.
    #[must_use]
    pub fn between(old: &TableDescriptor, new: &TableDescriptor) -> Self {
        let pairs = new
            .columns
            .iter()
            .filter(|c| old.get_column(&c.name).is_some())
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect();
        Self { pairs }
    }

    /// Returns the `(old, new)` column pairs.
    #[must_use]
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Returns the source columns, in copy order.
    pub fn old_columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(old, _)| old.as_str())
    }

    /// Returns the target columns, in copy order.
    pub fn new_columns(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(_, new)| new.as_str())
    }

    /// Returns true if `column` of the new table receives copied data.
    #[must_use]
    pub fn maps_to(&self, column: &str) -> bool {
        self.pairs.iter().any(|(_, new)| new == column)
    }

    /// Returns true when no column survives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    /// Create a table.
    CreateTable(TableDescriptor),

    /// Drop a table and everything in it.
    DropTable(String),

    /// Append a nullable or defaulted column.
    AddColumn {
        /// Table name.
        table: String,
        /// The new column.
        column: ColumnDescriptor,
    },

    /// Rebuild a table as `new`, copying surviving columns from `old`.
    RecreateTable {
        /// Table name.
        table: String,
        /// Name of the scratch table the new structure is built in.
        temp_table: String,
        /// Live structure.
        old: TableDescriptor,
        /// Declared structure.
        new: TableDescriptor,
        /// Surviving columns.
        mapping: ColumnMapping,
    },

    /// Create an index.
    CreateIndex {
        /// Indexed table.
        table: String,
        /// The index, with its name resolved.
        index: IndexDescriptor,
    },

    /// Drop an index.
    DropIndex {
        /// Indexed table.
        table: String,
        /// Index name.
        name: String,
    },
}

impl MigrationStep {
    /// Returns the step's kind.
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self {
            Self::CreateTable(_) => StepKind::CreateTable,
            Self::DropTable(_) => StepKind::DropTable,
            Self::AddColumn { .. } => StepKind::AddColumn,
            Self::RecreateTable { .. } => StepKind::RecreateTable,
            Self::CreateIndex { .. } => StepKind::CreateIndex,
            Self::DropIndex { .. } => StepKind::DropIndex,
        }
    }

    /// Returns the table the step applies to.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::CreateTable(table) => &table.name,
            Self::DropTable(name) => name,
            Self::AddColumn { table, .. }
            | Self::RecreateTable { table, .. }
            | Self::CreateIndex { table, .. }
            | Self::DropIndex { table, .. } => table,
        }
    }

    /// Returns true for steps that can discard stored data.
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        match self {
            Self::DropTable(_) => true,
            Self::RecreateTable { old, mapping, .. } => mapping.pairs().len() < old.columns.len(),
            _ => false,
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddColumn { table, column } => {
                write!(f, "AddColumn({table}.{})", column.name)
            }
            Self::CreateIndex { table, index } => {
                write!(f, "CreateIndex({table}.{})", index.name)
            }
            Self::DropIndex { table, name } => write!(f, "DropIndex({table}.{name})"),
            _ => write!(f, "{}({})", self.kind(), self.table_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SqlType;

    fn table(columns: &[&str]) -> TableDescriptor {
        columns.iter().fold(TableDescriptor::new("t"), |t, name| {
            t.column(ColumnDescriptor::new(*name, SqlType::Text))
        })
    }

    #[test]
    fn test_mapping_matches_by_name() {
        let mapping = ColumnMapping::between(&table(&["id", "a", "b"]), &table(&["b", "id", "c"]));
        assert_eq!(mapping.old_columns().collect::<Vec<_>>(), vec!["b", "id"]);
        assert!(mapping.maps_to("id"));
        assert!(!mapping.maps_to("c"));
    }

    #[test]
    fn test_mapping_is_case_sensitive() {
        let mapping = ColumnMapping::between(&table(&["Name"]), &table(&["name"]));
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_destructive_steps() {
        let old = table(&["id", "a"]);
        let new = table(&["id"]);
        let recreate = MigrationStep::RecreateTable {
            table: "t".into(),
            temp_table: "t_tmp".into(),
            mapping: ColumnMapping::between(&old, &new),
            old,
            new,
        };
        assert!(recreate.is_destructive());
        assert!(MigrationStep::DropTable("t".into()).is_destructive());
        assert!(!MigrationStep::CreateTable(table(&["id"])).is_destructive());
        assert_eq!(recreate.to_string(), "RecreateTable(t)");
    }
}
