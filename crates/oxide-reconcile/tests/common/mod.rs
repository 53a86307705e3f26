#![allow(dead_code)]

use std::path::Path;
use std::str::FromStr;

use oxide_reconcile::prelude::*;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

pub async fn file_pool(dir: &Path, max_connections: u32) -> SqlitePool {
    let url = format!("sqlite:{}", dir.join("test.db").display());
    let options = SqliteConnectOptions::from_str(&url)
        .expect("Invalid database URL")
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .expect("Failed to create file-backed SQLite pool")
}

pub async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql)
        .execute(pool)
        .await
        .unwrap_or_else(|e| panic!("Failed to execute: {sql}\nError: {e}"));
}

/// Every catalog entry, as `(type, name, sql)`, ordered by name.
pub async fn catalog(pool: &SqlitePool) -> Vec<(String, String, Option<String>)> {
    sqlx::query_as("SELECT type, name, sql FROM sqlite_master ORDER BY name")
        .fetch_all(pool)
        .await
        .expect("Failed to read sqlite_master")
}

pub async fn table_names(pool: &SqlitePool) -> Vec<String> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .expect("Failed to list tables");
    rows.into_iter().map(|(name,)| name).collect()
}

pub async fn foreign_keys_enabled(pool: &SqlitePool) -> bool {
    let (enabled,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
        .fetch_one(pool)
        .await
        .expect("Failed to read foreign_keys pragma");
    enabled != 0
}

pub fn kinds(steps: &[MigrationStep]) -> Vec<(StepKind, String)> {
    steps
        .iter()
        .map(|s| (s.kind(), s.table_name().to_string()))
        .collect()
}

/// `people(id INTEGER PRIMARY KEY, name TEXT NOT NULL)`
pub fn people() -> TableDescriptor {
    TableDescriptor::new("people")
        .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
        .column(ColumnDescriptor::new("name", SqlType::Text).not_null())
}

pub fn parent() -> TableDescriptor {
    TableDescriptor::new("parent")
        .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
        .column(ColumnDescriptor::new("label", SqlType::Text))
}

pub fn child() -> TableDescriptor {
    TableDescriptor::new("child")
        .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
        .column(ColumnDescriptor::new("parent_id", SqlType::Integer).not_null())
        .foreign_key(
            ForeignKeyDescriptor::new("parent_id", "parent", "id")
                .on_delete(ForeignKeyAction::Cascade),
        )
}
