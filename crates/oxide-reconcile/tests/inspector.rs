//! Inspector round trips: what the engine creates reads back as declared.

mod common;

use oxide_reconcile::prelude::*;

use common::*;

fn accounts() -> TableDescriptor {
    TableDescriptor::new("accounts")
        .column(
            ColumnDescriptor::new("id", SqlType::Integer)
                .primary_key()
                .auto_increment(),
        )
        .column(
            ColumnDescriptor::new("handle", SqlType::Text)
                .not_null()
                .collate("nocase")
                .indexed(),
        )
        .column(
            ColumnDescriptor::new("balance", SqlType::Real)
                .not_null()
                .default(DefaultValue::Float(2.5)),
        )
        .column(
            ColumnDescriptor::new("motto", SqlType::Text).default(DefaultValue::String("it's".into())),
        )
        .column(
            ColumnDescriptor::new("created_at", SqlType::Text)
                .not_null()
                .default(DefaultValue::Expression("CURRENT_TIMESTAMP".into())),
        )
        .column(ColumnDescriptor::new("region", SqlType::Custom("varchar(8)".into())))
        .index(IndexDescriptor::new(["region", "handle"]).unique())
}

fn memberships() -> TableDescriptor {
    TableDescriptor::new("memberships")
        .column(ColumnDescriptor::new("account_id", SqlType::Integer).primary_key())
        .column(ColumnDescriptor::new("team", SqlType::Text).primary_key())
        .column(ColumnDescriptor::new("note", SqlType::Blob))
        .foreign_key(
            ForeignKeyDescriptor::new("account_id", "accounts", "id")
                .on_delete(ForeignKeyAction::Cascade)
                .on_update(ForeignKeyAction::Restrict),
        )
}

#[tokio::test]
async fn created_tables_read_back_in_canonical_form() {
    let engine = MigrationEngine::new(memory_pool().await);
    engine
        .migrate(&[memberships(), accounts()], MigrateOptions::default())
        .await
        .unwrap();

    let live = engine.inspect().await.unwrap();
    assert_eq!(live["accounts"], accounts().canonical());
    assert_eq!(live["memberships"], memberships().canonical());
    assert_eq!(Fingerprint::of(&live["accounts"]), Fingerprint::of(&accounts()));
}

#[tokio::test]
async fn boolean_defaults_compare_by_rendered_sql() {
    let declared = TableDescriptor::new("flags")
        .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
        .column(
            ColumnDescriptor::new("enabled", SqlType::Integer)
                .not_null()
                .default(DefaultValue::Bool(true)),
        );
    let engine = MigrationEngine::new(memory_pool().await);
    engine
        .migrate(&[declared.clone()], MigrateOptions::default())
        .await
        .unwrap();

    let live = engine.inspect().await.unwrap();
    assert_eq!(live["flags"].columns[1].default, DefaultValue::Integer(1));
    assert_eq!(Fingerprint::of(&live["flags"]), Fingerprint::of(&declared));
}

#[tokio::test]
async fn hand_written_schema_is_inspected() {
    let pool = memory_pool().await;
    exec(
        &pool,
        "CREATE TABLE notes (\n  \
         id INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
         body TEXT COLLATE RTRIM NOT NULL,\n  \
         tag TEXT UNIQUE\n)",
    )
    .await;
    exec(&pool, "CREATE INDEX notes_by_body ON notes (body)").await;

    let live = MigrationEngine::new(pool).inspect().await.unwrap();
    let notes = &live["notes"];

    assert!(notes.columns[0].auto_increment);
    assert_eq!(notes.columns[1].collation.as_deref(), Some("RTRIM"));
    assert!(!notes.columns[1].nullable);
    assert!(notes.columns[2].nullable);
    // The UNIQUE constraint's automatic index is part of the table itself.
    assert_eq!(
        notes.indices,
        vec![IndexDescriptor::new(["body"]).named("notes_by_body")]
    );
}

#[tokio::test]
async fn inspected_schema_is_declarable() {
    let pool = memory_pool().await;
    exec(
        &pool,
        "CREATE TABLE legacy (id INTEGER PRIMARY KEY, name TEXT NOT NULL DEFAULT 'n/a')",
    )
    .await;
    let engine = MigrationEngine::new(pool);

    let declared: Vec<TableDescriptor> = engine.inspect().await.unwrap().into_values().collect();
    let json = serde_json::to_string(&declared).unwrap();
    let parsed: Vec<TableDescriptor> = serde_json::from_str(&json).unwrap();

    let report = engine
        .migrate(&parsed, MigrateOptions::default())
        .await
        .unwrap();
    assert!(report.is_noop());
    assert_eq!(report.fingerprints_written, vec!["legacy"]);
}

#[tokio::test]
async fn keyword_column_names_keep_their_clauses() {
    let pool = memory_pool().await;
    let engine = MigrationEngine::new(pool.clone());
    let v1 = TableDescriptor::new("rules")
        .column(ColumnDescriptor::new("id", SqlType::Integer).primary_key())
        .column(ColumnDescriptor::new("check", SqlType::Text).collate("NOCASE"))
        .column(ColumnDescriptor::new("unique", SqlType::Text).collate("RTRIM"));
    engine.migrate(&[v1.clone()], MigrateOptions::default()).await.unwrap();

    let live = engine.inspect().await.unwrap();
    assert_eq!(live["rules"], v1.canonical());

    let v2 = v1.column(ColumnDescriptor::new("nickname", SqlType::Text));
    let report = engine.migrate(&[v2], MigrateOptions::default()).await.unwrap();
    assert_eq!(
        kinds(&report.plan),
        vec![(StepKind::AddColumn, "rules".to_string())]
    );
}
