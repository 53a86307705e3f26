//! Error types for schema reconciliation.

use std::time::Duration;

use crate::step::StepKind;
use crate::trace::TraceEvent;

/// Errors that can occur while planning or applying a reconciliation.
///
/// Every variant aborts the whole run; nothing is partially committed.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A declared foreign key targets a table that is not declared.
    #[error(
        "Table '{table}' has a foreign key on '{column}' to undeclared table '{references}'"
    )]
    UnresolvedForeignKey {
        /// The referencing table.
        table: String,
        /// The referencing column.
        column: String,
        /// The missing referenced table.
        references: String,
    },

    /// Foreign keys among declared tables form a cycle.
    #[error("Foreign keys form a cycle between tables: {}", .tables.join(", "))]
    SchemaCycle {
        /// Tables left unordered by the cycle.
        tables: Vec<String>,
    },

    /// Live tables are no longer declared and dropping them was not allowed.
    #[error("Refusing to drop undeclared tables: {}", .tables.join(", "))]
    DestructiveDropRefused {
        /// The undeclared live tables.
        tables: Vec<String>,
    },

    /// A NOT NULL column without a default cannot be filled for existing rows.
    #[error(
        "Cannot add NOT NULL column '{column}' without a default to populated table '{table}'"
    )]
    IncompatibleColumnAddition {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A DDL or DML statement failed.
    #[error(transparent)]
    Step(#[from] MigrationStepError),

    /// A declared descriptor violates its own invariants.
    #[error("Invalid descriptor for table '{table}': {message}")]
    InvalidDescriptor {
        /// Table name.
        table: String,
        /// What is wrong.
        message: String,
    },

    /// Dangling foreign key references were found before commit.
    #[error("{count} foreign key violation(s) in table '{table}'")]
    ForeignKeyViolation {
        /// First table with violations.
        table: String,
        /// Number of violating rows in that table.
        count: usize,
    },

    /// The per-database migration lock could not be taken in time.
    #[error("Timed out after {0:?} waiting for the migration lock")]
    LockTimeout(Duration),

    /// The migration task ended without producing a result.
    #[error("Migration task aborted: {0}")]
    Aborted(String),

    /// Database error outside of step execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading descriptor files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A migration step whose SQL failed to execute.
#[derive(Debug, thiserror::Error)]
#[error("{kind} on '{table}' failed at `{statement}`: {source}")]
pub struct MigrationStepError {
    /// Kind of the failing step.
    pub kind: StepKind,
    /// Table the step applies to.
    pub table: String,
    /// The statement that failed.
    pub statement: String,
    /// The underlying database error.
    #[source]
    pub source: sqlx::Error,
}

/// The error returned by a failed migration run.
///
/// Carries the trace of every step attempted before the failure, the failing
/// step included.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct MigrationError {
    #[source]
    source: MigrateError,
    trace: Vec<TraceEvent>,
}

impl MigrationError {
    /// Creates an error with the given trace.
    #[must_use]
    pub fn new(source: MigrateError, trace: Vec<TraceEvent>) -> Self {
        Self { source, trace }
    }

    /// Returns the underlying cause.
    #[must_use]
    pub fn kind(&self) -> &MigrateError {
        &self.source
    }

    /// Returns the steps attempted before the run was aborted.
    #[must_use]
    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    /// Consumes the error, returning the underlying cause.
    #[must_use]
    pub fn into_kind(self) -> MigrateError {
        self.source
    }
}

impl From<MigrateError> for MigrationError {
    fn from(source: MigrateError) -> Self {
        Self::new(source, Vec::new())
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
