//! Step executor.
//!
//! This module applies planned steps to a connection that is already inside
//! the run's transaction. It never begins, commits or rolls back on its own.

use sqlx::SqliteConnection;
use tracing::debug;

use crate::dialect::MigrationDialect;
use crate::error::{MigrateError, MigrationStepError, Result};
use crate::schema::TableDescriptor;
use crate::step::{ColumnMapping, MigrationStep};

/// Applies migration steps with a given dialect.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor<D: MigrationDialect> {
    dialect: D,
}

impl<D: MigrationDialect> StepExecutor<D> {
    /// Creates a new step executor.
    pub const fn new(dialect: D) -> Self {
        Self { dialect }
    }

    /// Returns the dialect.
    #[must_use]
    pub const fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Generates the statements for a step without executing them.
    #[must_use]
    pub fn sql_for(&self, step: &MigrationStep) -> Vec<String> {
        self.dialect.generate_sql(step)
    }

    /// Applies a single step.
    ///
    /// Every statement that was attempted, the failing one included, is
    /// appended to `executed`.
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        step: &MigrationStep,
        executed: &mut Vec<String>,
    ) -> Result<()> {
        if let MigrationStep::RecreateTable { table, new, mapping, .. } = step {
            self.check_unmapped_columns(conn, table, new, mapping).await?;
        }

        for sql in self.dialect.generate_sql(step) {
            debug!(sql = %sql, "Executing SQL");
            executed.push(sql.clone());

            if let Err(source) = sqlx::query(&sql).execute(&mut *conn).await {
                return Err(MigrationStepError {
                    kind: step.kind(),
                    table: step.table_name().to_string(),
                    statement: sql,
                    source,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Rejects a rebuild that would leave existing rows without a value for a
    /// new NOT NULL column.
    async fn check_unmapped_columns(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        new: &TableDescriptor,
        mapping: &ColumnMapping,
    ) -> Result<()> {
        let rowid_alias = {
            let pk = new.primary_key();
            (pk.len() == 1)
                .then(|| new.get_column(pk[0]))
                .flatten()
                .filter(|c| c.sql_type.is_integer())
                .map(|c| c.name.as_str())
        };

        let blocking = new.columns.iter().find(|c| {
            !mapping.maps_to(&c.name) && !c.can_be_omitted() && Some(c.name.as_str()) != rowid_alias
        });
        let Some(column) = blocking else {
            return Ok(());
        };

        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            self.dialect.quote_identifier(table)
        );
        let (rows,): (i64,) = sqlx::query_as(&sql).fetch_one(&mut *conn).await?;
        if rows > 0 {
            return Err(MigrateError::IncompatibleColumnAddition {
                table: table.to_string(),
                column: column.name.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::schema::{ColumnDescriptor, SqlType};
    use sqlx::Connection;

    async fn connect() -> SqliteConnection {
        SqliteConnection::connect(":memory:")
            .await
            .expect("Failed to open in-memory SQLite connection")
    }

    fn users() -> TableDescriptor {
        TableDescriptor::new("users")
            .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
            .column(ColumnDescriptor::new("name", SqlType::Text))
    }

    fn recreate(old: TableDescriptor, new: TableDescriptor) -> MigrationStep {
        MigrationStep::RecreateTable {
            table: "users".into(),
            temp_table: "_oxide_tmp_users".into(),
            mapping: ColumnMapping::between(&old, &new),
            old,
            new,
        }
    }

    #[tokio::test]
    async fn test_apply_create_table() {
        let mut conn = connect().await;
        let executor = StepExecutor::new(SqliteDialect::new());
        let mut executed = Vec::new();

        executor
            .apply(&mut conn, &MigrationStep::CreateTable(users()), &mut executed)
            .await
            .unwrap();

        assert_eq!(executed.len(), 1);
        let row: (String,) =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'users'")
                .fetch_one(&mut conn)
                .await
                .unwrap();
        assert_eq!(row.0, "users");
    }

    #[tokio::test]
    async fn test_failing_statement_is_reported() {
        let mut conn = connect().await;
        let executor = StepExecutor::new(SqliteDialect::new());
        let mut executed = Vec::new();

        let err = executor
            .apply(
                &mut conn,
                &MigrationStep::DropTable("missing".into()),
                &mut executed,
            )
            .await
            .unwrap_err();

        assert_eq!(executed, vec!["DROP TABLE \"missing\""]);
        match err {
            MigrateError::Step(step) => {
                assert_eq!(step.table, "missing");
                assert_eq!(step.statement, "DROP TABLE \"missing\"");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recreate_copies_rows() {
        let mut conn = connect().await;
        let executor = StepExecutor::new(SqliteDialect::new());
        let mut executed = Vec::new();
        executor
            .apply(&mut conn, &MigrationStep::CreateTable(users()), &mut executed)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, name) VALUES (1, 'ada'), (2, NULL)")
            .execute(&mut conn)
            .await
            .unwrap();

        let new = users().column(ColumnDescriptor::new("score", SqlType::Real));
        executor
            .apply(&mut conn, &recreate(users(), new), &mut executed)
            .await
            .unwrap();

        let rows: Vec<(i64, Option<String>, Option<f64>)> =
            sqlx::query_as("SELECT id, name, score FROM users ORDER BY id")
                .fetch_all(&mut conn)
                .await
                .unwrap();
        assert_eq!(
            rows,
            vec![(1, Some("ada".into()), None), (2, None, None)]
        );
    }

    #[tokio::test]
    async fn test_recreate_rejects_required_column_on_populated_table() {
        let mut conn = connect().await;
        let executor = StepExecutor::new(SqliteDialect::new());
        let mut executed = Vec::new();
        executor
            .apply(&mut conn, &MigrationStep::CreateTable(users()), &mut executed)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, name) VALUES (1, 'ada')")
            .execute(&mut conn)
            .await
            .unwrap();

        let new = users().column(ColumnDescriptor::new("email", SqlType::Text).not_null());
        let err = executor
            .apply(&mut conn, &recreate(users(), new), &mut executed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrateError::IncompatibleColumnAddition { ref column, .. } if column == "email"
        ));
    }

    #[tokio::test]
    async fn test_recreate_allows_required_column_on_empty_table() {
        let mut conn = connect().await;
        let executor = StepExecutor::new(SqliteDialect::new());
        let mut executed = Vec::new();
        executor
            .apply(&mut conn, &MigrationStep::CreateTable(users()), &mut executed)
            .await
            .unwrap();

        let new = users().column(ColumnDescriptor::new("email", SqlType::Text).not_null());
        executor
            .apply(&mut conn, &recreate(users(), new), &mut executed)
            .await
            .unwrap();
    }
}
