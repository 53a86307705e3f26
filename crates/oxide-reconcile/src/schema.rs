//! Schema descriptor types.
//!
//! A [`TableDescriptor`] describes the structure a table should have. The
//! same types describe what the code declares and what the inspector reads
//! back from the live catalog, so the two can be compared directly once both
//! are brought into [canonical form](TableDescriptor::canonical).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// SQLite column type affinities, plus verbatim declared types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    /// `INTEGER` (the only type usable for rowid aliases and `AUTOINCREMENT`).
    Integer,
    /// `REAL`.
    Real,
    /// `TEXT`.
    Text,
    /// `BLOB`.
    Blob,
    /// `NUMERIC`.
    Numeric,
    /// Any other declared type, kept as written (e.g. `VARCHAR(64)`).
    Custom(String),
}

impl SqlType {
    /// Returns the type name as written in a column definition.
    #[must_use]
    pub fn sqlite_name(&self) -> &str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Numeric => "NUMERIC",
            Self::Custom(name) => name,
        }
    }

    /// Parses a declared type as reported by `pragma_table_info`.
    #[must_use]
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        match upper.as_str() {
            "INTEGER" => Self::Integer,
            "REAL" => Self::Real,
            "TEXT" => Self::Text,
            "BLOB" => Self::Blob,
            "NUMERIC" => Self::Numeric,
            _ => Self::Custom(upper),
        }
    }

    /// Returns true for the exact `INTEGER` type.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        self.sqlite_name().eq_ignore_ascii_case("INTEGER")
    }

    fn normalized(&self) -> Self {
        Self::from_declared(self.sqlite_name())
    }
}

/// Default value for a column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum DefaultValue {
    /// No default value.
    #[default]
    None,
    /// NULL default.
    Null,
    /// Boolean default.
    Bool(bool),
    /// Integer default.
    Integer(i64),
    /// Float default.
    Float(f64),
    /// String default.
    String(String),
    /// SQL expression (e.g., "CURRENT_TIMESTAMP").
    Expression(String),
}

impl DefaultValue {
    /// Returns the SQL representation of this default value.
    #[must_use]
    pub fn to_sql(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Null => Some("NULL".to_string()),
            Self::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
            Self::Expression(expr) => Some(expr.clone()),
        }
    }

    /// Parses the default clause text reported by `pragma_table_info`.
    #[must_use]
    pub fn from_sql(text: &str) -> Self {
        let text = text.trim();
        if text.eq_ignore_ascii_case("NULL") {
            return Self::Null;
        }
        if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
            return Self::String(text[1..text.len() - 1].replace("''", "'"));
        }
        if let Ok(i) = text.parse::<i64>() {
            return Self::Integer(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            if f.is_finite() {
                return Self::Float(f);
            }
        }
        Self::Expression(text.to_string())
    }

    /// Returns true when no default is set.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns true for a default that supplies a non-NULL value.
    #[must_use]
    pub fn supplies_value(&self) -> bool {
        !matches!(self, Self::None | Self::Null)
    }

    /// Returns true for literal defaults that `ALTER TABLE ADD COLUMN` accepts.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        !matches!(self, Self::Expression(_))
    }
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    #[default]
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }

    /// Parses an action as reported by `pragma_foreign_key_list`.
    #[must_use]
    pub fn from_sql(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => Self::Restrict,
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }
}

const fn default_nullable() -> bool {
    true
}

/// Description of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub sql_type: SqlType,
    /// Whether the column allows NULL values.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Default value.
    #[serde(default)]
    pub default: DefaultValue,
    /// Whether this column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Whether this column auto-increments.
    #[serde(default)]
    pub auto_increment: bool,
    /// Collating sequence (`BINARY`, `NOCASE`, `RTRIM`, ...).
    #[serde(default)]
    pub collation: Option<String>,
    /// Shorthand for a single-column index on this column.
    #[serde(default)]
    pub indexed: bool,
}

impl ColumnDescriptor {
    /// Creates a nullable column with no default.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            default: DefaultValue::None,
            primary_key: false,
            auto_increment: false,
            collation: None,
            indexed: false,
        }
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the column as nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: DefaultValue) -> Self {
        self.default = value;
        self
    }

    /// Sets the column as (part of) the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false; // Primary keys are always NOT NULL
        self
    }

    /// Sets the column to auto-increment.
    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Sets the collating sequence.
    #[must_use]
    pub fn collate(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    /// Requests a single-column index on this column.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Returns true when rows can be inserted without supplying this column.
    #[must_use]
    pub fn can_be_omitted(&self) -> bool {
        self.nullable || self.default.supplies_value()
    }
}

/// Description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name. Empty means "derive from table and columns".
    #[serde(default)]
    pub name: String,
    /// Indexed columns, in key order.
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDescriptor {
    /// Creates an unnamed, non-unique index.
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: String::new(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Sets an explicit name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks the index as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Returns the index name, deriving it for unnamed indices.
    #[must_use]
    pub fn resolved_name(&self, table: &str) -> String {
        if self.name.is_empty() {
            index_name(table, &self.columns)
        } else {
            self.name.clone()
        }
    }
}

/// Derives the deterministic name of an unnamed index.
#[must_use]
pub fn index_name(table: &str, columns: &[String]) -> String {
    format!("idx_{}_{}", table, columns.join("_"))
}

/// Description of a single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    /// Referencing column in this table.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column. Empty means the referenced table's primary key.
    #[serde(default)]
    pub references_column: String,
    /// Action on delete.
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// Action on update.
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKeyDescriptor {
    /// Creates a foreign key from `column` to `table(references_column)`.
    #[must_use]
    pub fn new(
        column: impl Into<String>,
        table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: table.into(),
            references_column: references_column.into(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = action;
        self
    }
}

/// Complete description of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table name.
    pub name: String,
    /// Column definitions, in table order.
    pub columns: Vec<ColumnDescriptor>,
    /// Index definitions.
    #[serde(default)]
    pub indices: Vec<IndexDescriptor>,
    /// Foreign key definitions.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl TableDescriptor {
    /// Creates an empty table descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indices: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Adds a column to the table.
    #[must_use]
    pub fn column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indices.push(index);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Gets an index by name.
    #[must_use]
    pub fn get_index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indices.iter().find(|i| i.name == name)
    }

    /// Returns the primary key columns in table order.
    #[must_use]
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Returns the other tables this table references through foreign keys.
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.references_table.as_str())
            .filter(move |t| *t != self.name)
    }

    /// Returns the normalized form used for comparison and fingerprinting.
    ///
    /// Types and collations are upper-cased, primary key columns are NOT
    /// NULL, `indexed` shorthands become named indices, and indices and
    /// foreign keys are sorted. Column order is preserved.
    #[must_use]
    pub fn canonical(&self) -> Self {
        let columns: Vec<ColumnDescriptor> = self
            .columns
            .iter()
            .map(|c| ColumnDescriptor {
                name: c.name.clone(),
                sql_type: c.sql_type.normalized(),
                nullable: c.nullable && !c.primary_key,
                default: c.default.clone(),
                primary_key: c.primary_key,
                auto_increment: c.auto_increment,
                collation: c.collation.as_ref().map(|s| s.to_ascii_uppercase()),
                indexed: false,
            })
            .collect();

        let mut indices: Vec<IndexDescriptor> = self
            .indices
            .iter()
            .map(|i| IndexDescriptor {
                name: i.resolved_name(&self.name),
                columns: i.columns.clone(),
                unique: i.unique,
            })
            .collect();
        for column in self.columns.iter().filter(|c| c.indexed) {
            let shorthand = IndexDescriptor::new([column.name.clone()]);
            let name = shorthand.resolved_name(&self.name);
            if !indices.iter().any(|i| i.name == name) {
                indices.push(shorthand.named(name));
            }
        }
        indices.sort_by(|a, b| a.name.cmp(&b.name));

        let mut foreign_keys = self.foreign_keys.clone();
        foreign_keys.sort();

        Self {
            name: self.name.clone(),
            columns,
            indices,
            foreign_keys,
        }
    }

    /// Checks the descriptor's own invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| MigrateError::InvalidDescriptor {
            table: self.name.clone(),
            message,
        };

        if self.name.is_empty() {
            return Err(invalid("table name is empty".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("table has no columns".to_string()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(invalid(format!("duplicate column '{}'", column.name)));
            }
        }

        let primary_key = self.primary_key();
        for column in self.columns.iter().filter(|c| c.auto_increment) {
            if !column.primary_key || !column.sql_type.is_integer() || primary_key.len() != 1 {
                return Err(invalid(format!(
                    "auto-increment column '{}' must be the sole INTEGER primary key",
                    column.name
                )));
            }
        }

        for index in &self.indices {
            if index.columns.is_empty() {
                return Err(invalid(format!(
                    "index '{}' has no columns",
                    index.resolved_name(&self.name)
                )));
            }
            if let Some(missing) = index.columns.iter().find(|c| self.get_column(c).is_none()) {
                return Err(invalid(format!(
                    "index '{}' references unknown column '{missing}'",
                    index.resolved_name(&self.name)
                )));
            }
        }

        for fk in &self.foreign_keys {
            if self.get_column(&fk.column).is_none() {
                return Err(invalid(format!(
                    "foreign key references unknown column '{}'",
                    fk.column
                )));
            }
        }

        Ok(())
    }
}

/// A model type that can describe its own table.
///
/// Implemented per model, typically by generated code.
pub trait Table {
    /// Returns the declared structure of the model's table.
    fn descriptor() -> TableDescriptor;
}

/// An ordered set of declared tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSet {
    tables: Vec<TableDescriptor>,
}

impl SchemaSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the table of a [`Table`] model.
    #[must_use]
    pub fn table<T: Table>(self) -> Self {
        self.descriptor(T::descriptor())
    }

    /// Adds a descriptor.
    #[must_use]
    pub fn descriptor(mut self, table: TableDescriptor) -> Self {
        self.tables.push(table);
        self
    }

    /// Returns the declared tables in declaration order.
    #[must_use]
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    /// Gets a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns table names.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Validates every table and checks table names are unique.
    pub fn validate(&self) -> Result<()> {
        validate_all(&self.tables)
    }
}

impl From<Vec<TableDescriptor>> for SchemaSet {
    fn from(tables: Vec<TableDescriptor>) -> Self {
        Self { tables }
    }
}

/// Validates a list of declared tables.
pub(crate) fn validate_all(tables: &[TableDescriptor]) -> Result<()> {
    let mut names = HashSet::new();
    for table in tables {
        table.validate()?;
        if !names.insert(table.name.as_str()) {
            return Err(MigrateError::InvalidDescriptor {
                table: table.name.clone(),
                message: "table is declared more than once".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDescriptor {
        TableDescriptor::new("users")
            .column(
                ColumnDescriptor::new("id", SqlType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .column(
                ColumnDescriptor::new("email", SqlType::Text)
                    .not_null()
                    .collate("nocase")
                    .indexed(),
            )
            .column(ColumnDescriptor::new("nickname", SqlType::Custom("varchar(32)".into())))
    }

    #[test]
    fn test_column_builder() {
        let col = ColumnDescriptor::new("id", SqlType::Integer)
            .primary_key()
            .auto_increment();

        assert_eq!(col.name, "id");
        assert!(col.primary_key);
        assert!(col.auto_increment);
        assert!(!col.nullable); // Primary keys are NOT NULL
    }

    #[test]
    fn test_canonical_folds_shorthand_index() {
        let canonical = users().canonical();
        assert_eq!(canonical.indices.len(), 1);
        assert_eq!(canonical.indices[0].name, "idx_users_email");
        assert!(canonical.columns.iter().all(|c| !c.indexed));
        assert_eq!(canonical.columns[1].collation.as_deref(), Some("NOCASE"));
        assert_eq!(
            canonical.columns[2].sql_type,
            SqlType::Custom("VARCHAR(32)".into())
        );
    }

    #[test]
    fn test_canonical_is_idempotent() {
        let once = users().canonical();
        assert_eq!(once.canonical(), once);
    }

    #[test]
    fn test_default_value_round_trips_through_sql() {
        for value in [
            DefaultValue::Null,
            DefaultValue::Integer(-7),
            DefaultValue::Float(2.5),
            DefaultValue::String("it's".into()),
            DefaultValue::Expression("CURRENT_TIMESTAMP".into()),
        ] {
            let sql = value.to_sql().unwrap();
            assert_eq!(DefaultValue::from_sql(&sql), value, "{sql}");
        }
        assert_eq!(
            DefaultValue::from_sql(&DefaultValue::Bool(true).to_sql().unwrap()),
            DefaultValue::Integer(1)
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_columns() {
        let table = TableDescriptor::new("t")
            .column(ColumnDescriptor::new("a", SqlType::Text))
            .column(ColumnDescriptor::new("a", SqlType::Integer));
        assert!(matches!(
            table.validate(),
            Err(MigrateError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_integer_autoincrement() {
        let table = TableDescriptor::new("t").column(
            ColumnDescriptor::new("id", SqlType::Text)
                .primary_key()
                .auto_increment(),
        );
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_index_column() {
        let table = TableDescriptor::new("t")
            .column(ColumnDescriptor::new("a", SqlType::Text))
            .index(IndexDescriptor::new(["b"]));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_schema_set_rejects_duplicate_tables() {
        let set = SchemaSet::new().descriptor(users()).descriptor(users());
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_table_trait() {
        struct User;
        impl Table for User {
            fn descriptor() -> TableDescriptor {
                users()
            }
        }

        let set = SchemaSet::new().table::<User>();
        assert_eq!(set.table_names().collect::<Vec<_>>(), vec!["users"]);
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_descriptor_from_json_uses_defaults() {
        let json = r#"{
            "name": "t",
            "columns": [
                { "name": "id", "sql_type": "Integer", "primary_key": true, "nullable": false },
                { "name": "label", "sql_type": "Text" }
            ]
        }"#;
        let table: TableDescriptor = serde_json::from_str(json).unwrap();
        assert!(table.columns[1].nullable);
        assert!(table.columns[1].default.is_none());
        assert!(table.indices.is_empty());
    }
}
