//! Declarative schema reconciliation for SQLite.
//!
//! `oxide-reconcile` keeps a live database in line with table descriptors
//! declared in code. There are no hand-written migration files:
//! - Each run inspects the live catalog and diffs it against the declarations
//! - Changes `ALTER TABLE` cannot express are carried out by rebuilding the
//!   table and copying its rows
//! - Every run is one transaction, applied completely or not at all
//!
//! # Architecture
//!
//! - **Schema** - `TableDescriptor` and friends, plus the `Table` trait for
//!   models that describe themselves
//! - **Fingerprint** - content hashes that let unchanged tables skip the diff
//! - **Inspector** - reads descriptors back from the live catalog
//! - **Differ** - compares declared and live descriptors into ordered steps
//! - **Executor** - turns steps into SQL through a dialect and runs them
//! - **Store** - the bookkeeping table of fingerprints from previous runs
//! - **Engine** - locking, the transaction, tracing and the run report
//!
//! # Example
//!
//! ```rust,no_run
//! use oxide_reconcile::prelude::*;
//! use sqlx::sqlite::SqlitePoolOptions;
//!
//! # async fn run() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let pool = SqlitePoolOptions::new().connect("sqlite:app.db").await?;
//! let engine = MigrationEngine::new(pool);
//!
//! let users = TableDescriptor::new("users")
//!     .column(
//!         ColumnDescriptor::new("id", SqlType::Integer)
//!             .primary_key()
//!             .auto_increment(),
//!     )
//!     .column(ColumnDescriptor::new("email", SqlType::Text).not_null().indexed())
//!     .column(ColumnDescriptor::new("nickname", SqlType::Text));
//!
//! let report = engine
//!     .migrate(&[users], MigrateOptions::new().trace_listener(TracingListener))
//!     .await?;
//! println!("{} step(s) applied", report.plan.len());
//! # Ok(())
//! # }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Show the steps a descriptor file would need
//! oxide-reconcile plan --schema schema.json
//!
//! # Apply them
//! oxide-reconcile migrate --schema schema.json
//!
//! # Dump the live schema as descriptors
//! oxide-reconcile inspect
//!
//! # List stored fingerprints
//! oxide-reconcile status
//! ```

pub mod dialect;
pub mod differ;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod inspector;
pub mod schema;
pub mod step;
pub mod store;
pub mod trace;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::dialect::{MigrationDialect, SqliteDialect};
    pub use crate::differ::{dependency_order, SchemaDiffer};
    pub use crate::engine::{EnginePhase, MigrateOptions, MigrationEngine, MigrationReport};
    pub use crate::error::{MigrateError, MigrationError, MigrationStepError, Result};
    pub use crate::executor::StepExecutor;
    pub use crate::fingerprint::Fingerprint;
    pub use crate::inspector::SchemaInspector;
    pub use crate::schema::{
        ColumnDescriptor, DefaultValue, ForeignKeyAction, ForeignKeyDescriptor, IndexDescriptor,
        SchemaSet, SqlType, Table, TableDescriptor,
    };
    pub use crate::step::{ColumnMapping, MigrationStep, StepKind};
    pub use crate::store::{FingerprintRecord, FingerprintStore, DEFAULT_STORE_TABLE};
    pub use crate::trace::{
        MemoryListener, NoopListener, StepOutcome, TraceEvent, TraceListener, TracingListener,
    };
}
