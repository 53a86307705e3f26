//! Migration engine.
//!
//! The engine runs one reconciliation per call: it inspects the live schema,
//! plans the steps that bring it in line with the declared tables and applies
//! them inside a single transaction. Calls on the same engine (and its
//! clones) are serialized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::{Connection, SqliteConnection};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::dialect::{MigrationDialect, SqliteDialect};
use crate::differ::SchemaDiffer;
use crate::error::{MigrateError, MigrationError, Result};
use crate::executor::StepExecutor;
use crate::fingerprint::Fingerprint;
use crate::inspector::SchemaInspector;
use crate::schema::{validate_all, TableDescriptor};
use crate::step::MigrationStep;
use crate::store::{FingerprintRecord, FingerprintStore};
use crate::trace::{NoopListener, StepOutcome, TraceEvent, TraceListener};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EnginePhase {
    /// No run in flight.
    Idle = 0,
    /// Reading the live schema and stored fingerprints.
    Inspecting = 1,
    /// Computing the plan.
    Diffing = 2,
    /// Applying steps.
    Executing = 3,
    /// Verifying and committing.
    Committing = 4,
    /// Undoing a failed run.
    RollingBack = 5,
}

impl EnginePhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Inspecting,
            2 => Self::Diffing,
            3 => Self::Executing,
            4 => Self::Committing,
            5 => Self::RollingBack,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Options for a single run.
#[derive(Clone)]
pub struct MigrateOptions {
    /// Drop live tables that are not declared.
    pub allow_destructive_drop: bool,
    /// Receives one event per step.
    pub trace_listener: Arc<dyn TraceListener>,
    /// How long to wait for a run already in flight. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Plan and trace, but roll back instead of applying.
    pub dry_run: bool,
    /// Run `PRAGMA foreign_key_check` before committing.
    pub verify_foreign_keys: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            allow_destructive_drop: false,
            trace_listener: Arc::new(NoopListener),
            lock_timeout: None,
            dry_run: false,
            verify_foreign_keys: true,
        }
    }
}

impl fmt::Debug for MigrateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrateOptions")
            .field("allow_destructive_drop", &self.allow_destructive_drop)
            .field("lock_timeout", &self.lock_timeout)
            .field("dry_run", &self.dry_run)
            .field("verify_foreign_keys", &self.verify_foreign_keys)
            .finish_non_exhaustive()
    }
}

impl MigrateOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows dropping undeclared tables.
    #[must_use]
    pub fn allow_destructive_drop(mut self, allow: bool) -> Self {
        self.allow_destructive_drop = allow;
        self
    }

    /// Sets the trace listener.
    #[must_use]
    pub fn trace_listener(mut self, listener: impl TraceListener + 'static) -> Self {
        self.trace_listener = Arc::new(listener);
        self
    }

    /// Sets a shared trace listener.
    #[must_use]
    pub fn shared_trace_listener(mut self, listener: Arc<dyn TraceListener>) -> Self {
        self.trace_listener = listener;
        self
    }

    /// Bounds the wait for the migration lock.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Enables or disables the foreign key check before commit.
    #[must_use]
    pub fn verify_foreign_keys(mut self, enabled: bool) -> Self {
        self.verify_foreign_keys = enabled;
        self
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// The steps, in execution order.
    pub plan: Vec<MigrationStep>,
    /// One event per step.
    pub trace: Vec<TraceEvent>,
    /// Tables whose fingerprint record was written.
    pub fingerprints_written: Vec<String>,
    /// Tables that were dropped.
    pub tables_dropped: Vec<String>,
    /// Whether the run was rolled back as a dry run.
    pub dry_run: bool,
}

impl MigrationReport {
    /// Returns true when the database already matched the declarations.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }
}

/// Reconciles a database with declared tables.
#[derive(Clone)]
pub struct MigrationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    pool: SqlitePool,
    store: FingerprintStore,
    executor: StepExecutor<SqliteDialect>,
    lock: Arc<Mutex<()>>,
    phase: AtomicU8,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("store", &self.inner.store)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    /// Creates an engine using the default bookkeeping table.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_store(pool, FingerprintStore::new())
    }

    /// Creates an engine using the given bookkeeping table.
    #[must_use]
    pub fn with_store(pool: SqlitePool, store: FingerprintStore) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                pool,
                store,
                executor: StepExecutor::new(SqliteDialect::new()),
                lock: Arc::new(Mutex::new(())),
                phase: AtomicU8::new(EnginePhase::Idle as u8),
            }),
        }
    }

    /// Returns the bookkeeping store.
    #[must_use]
    pub fn store(&self) -> &FingerprintStore {
        &self.inner.store
    }

    /// Returns the phase of the run in flight, or `Idle`.
    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    /// Brings the database in line with `schemas`.
    ///
    /// The run is all-or-nothing. On failure the returned error carries the
    /// trace of every step attempted, the failing one included.
    pub async fn migrate(
        &self,
        schemas: &[TableDescriptor],
        options: MigrateOptions,
    ) -> std::result::Result<MigrationReport, MigrationError> {
        let guard = self.lock(options.lock_timeout).await?;

        let inner = Arc::clone(&self.inner);
        let schemas = schemas.to_vec();
        // The spawned task owns the lock and connection, so dropping the
        // caller's future cannot cut a run short.
        let handle = tokio::spawn(async move {
            let _guard = guard;
            inner.run(&schemas, &options).await
        });

        match handle.await {
            Ok(result) => result,
            Err(err) => Err(MigrateError::Aborted(err.to_string()).into()),
        }
    }

    /// Computes the plan for `schemas` without applying it.
    pub async fn plan(
        &self,
        schemas: &[TableDescriptor],
        options: MigrateOptions,
    ) -> Result<Vec<MigrationStep>> {
        self.migrate(schemas, options.dry_run(true))
            .await
            .map(|report| report.plan)
            .map_err(MigrationError::into_kind)
    }

    /// Reads the live schema, without the bookkeeping table.
    pub async fn inspect(&self) -> Result<BTreeMap<String, TableDescriptor>> {
        let mut conn = self.inner.pool.acquire().await?;
        self.inner.inspector().inspect(&mut conn).await
    }

    /// Lists the stored fingerprint records.
    pub async fn fingerprints(&self) -> Result<Vec<FingerprintRecord>> {
        let mut conn = self.inner.pool.acquire().await?;
        self.inner.store.records(&mut conn).await
    }

    async fn lock(&self, timeout: Option<Duration>) -> Result<OwnedMutexGuard<()>> {
        let lock = Arc::clone(&self.inner.lock);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, lock.lock_owned())
                .await
                .map_err(|_| MigrateError::LockTimeout(limit)),
            None => Ok(lock.lock_owned().await),
        }
    }
}

impl EngineInner {
    fn set_phase(&self, phase: EnginePhase) {
        debug!(phase = %phase, "Engine phase");
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn inspector(&self) -> SchemaInspector {
        SchemaInspector::excluding([self.store.table_name()])
    }

    async fn run(
        &self,
        schemas: &[TableDescriptor],
        options: &MigrateOptions,
    ) -> std::result::Result<MigrationReport, MigrationError> {
        info!(
            tables = schemas.len(),
            dialect = self.executor.dialect().name(),
            dry_run = options.dry_run,
            "Starting migration"
        );
        let mut trace = Vec::new();

        let mut conn = self.pool.acquire().await.map_err(MigrateError::from)?;

        // Has no effect inside a transaction, so it is toggled around it.
        let (prior,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&mut *conn)
            .await
            .map_err(MigrateError::from)?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .map_err(MigrateError::from)?;

        let result = self
            .run_in_transaction(&mut conn, schemas, options, &mut trace)
            .await;

        let restore = if prior == 0 {
            "PRAGMA foreign_keys = OFF"
        } else {
            "PRAGMA foreign_keys = ON"
        };
        let restored = sqlx::query(restore).execute(&mut *conn).await;
        if let Err(ref err) = restored {
            warn!(error = %err, "Failed to restore foreign key enforcement, closing connection");
            drop(conn.detach());
        }
        self.set_phase(EnginePhase::Idle);

        match (result, restored) {
            (Ok(mut report), Ok(_)) => {
                report.trace = trace;
                info!(
                    steps = report.plan.len(),
                    written = report.fingerprints_written.len(),
                    "Migration finished"
                );
                Ok(report)
            }
            (Ok(_), Err(err)) => Err(MigrationError::new(err.into(), trace)),
            (Err(err), _) => Err(MigrationError::new(err, trace)),
        }
    }

    async fn run_in_transaction(
        &self,
        conn: &mut SqliteConnection,
        schemas: &[TableDescriptor],
        options: &MigrateOptions,
        trace: &mut Vec<TraceEvent>,
    ) -> Result<MigrationReport> {
        let mut tx = conn.begin().await?;

        match self.reconcile(&mut tx, schemas, options, trace).await {
            Ok(report) if report.dry_run => {
                tx.rollback().await?;
                Ok(report)
            }
            Ok(report) => {
                self.set_phase(EnginePhase::Committing);
                tx.commit().await?;
                Ok(report)
            }
            Err(err) => {
                self.set_phase(EnginePhase::RollingBack);
                warn!(error = %err, "Migration failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn reconcile(
        &self,
        conn: &mut SqliteConnection,
        schemas: &[TableDescriptor],
        options: &MigrateOptions,
        trace: &mut Vec<TraceEvent>,
    ) -> Result<MigrationReport> {
        validate_all(schemas)?;

        self.set_phase(EnginePhase::Inspecting);
        let live = self.inspector().inspect(conn).await?;
        let stored = self.store.load(conn).await?;

        self.set_phase(EnginePhase::Diffing);
        let token = format!("{:x}", Utc::now().timestamp_micros());
        let plan = SchemaDiffer::new(token)
            .reserve([self.store.table_name()])
            .plan(schemas, &live, &stored, options.allow_destructive_drop)?;
        info!(steps = plan.len(), "Plan computed");

        let tables_dropped: Vec<String> = plan
            .iter()
            .filter_map(|step| match step {
                MigrationStep::DropTable(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        let changed: Vec<(&str, Fingerprint)> = schemas
            .iter()
            .map(|t| (t.name.as_str(), Fingerprint::of(t)))
            .filter(|(name, fingerprint)| stored.get(*name) != Some(fingerprint))
            .collect();

        if options.dry_run {
            for step in &plan {
                let event = TraceEvent {
                    step_kind: step.kind(),
                    table_name: step.table_name().to_string(),
                    statements: self.executor.sql_for(step),
                    outcome: StepOutcome::Planned,
                    error_detail: None,
                };
                options.trace_listener.on_step(&event);
                trace.push(event);
            }
            return Ok(MigrationReport {
                plan,
                trace: Vec::new(),
                fingerprints_written: Vec::new(),
                tables_dropped,
                dry_run: true,
            });
        }

        self.set_phase(EnginePhase::Executing);
        for step in &plan {
            let mut executed = Vec::new();
            let result = self.executor.apply(conn, step, &mut executed).await;
            let event = TraceEvent {
                step_kind: step.kind(),
                table_name: step.table_name().to_string(),
                statements: executed,
                outcome: if result.is_ok() {
                    StepOutcome::Success
                } else {
                    StepOutcome::Error
                },
                error_detail: result.as_ref().err().map(ToString::to_string),
            };
            options.trace_listener.on_step(&event);
            trace.push(event);
            result?;
        }

        if options.verify_foreign_keys {
            check_foreign_keys(conn).await?;
        }

        let mut fingerprints_written = Vec::with_capacity(changed.len());
        if !changed.is_empty() {
            self.store.ensure_table(conn).await?;
            for (name, fingerprint) in changed {
                self.store.record(conn, name, &fingerprint).await?;
                fingerprints_written.push(name.to_string());
            }
        }
        for name in &tables_dropped {
            self.store.forget(conn, name).await?;
        }

        Ok(MigrationReport {
            plan,
            trace: Vec::new(),
            fingerprints_written,
            tables_dropped,
            dry_run: false,
        })
    }
}

/// Fails if any row holds a dangling foreign key reference.
async fn check_foreign_keys(conn: &mut SqliteConnection) -> Result<()> {
    let violations: Vec<(String, Option<i64>, String, i64)> =
        sqlx::query_as("PRAGMA foreign_key_check")
            .fetch_all(&mut *conn)
            .await?;

    let Some((table, ..)) = violations.first() else {
        return Ok(());
    };
    let count = violations.iter().filter(|(t, ..)| t == table).count();
    Err(MigrateError::ForeignKeyViolation {
        table: table.clone(),
        count,
    })
}
