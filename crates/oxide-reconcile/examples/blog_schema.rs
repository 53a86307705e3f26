//! Example: Blog Application Schema
//!
//! This example declares the tables of a small blog as Rust models, brings an
//! in-memory database in line with them, then evolves the declarations and
//! reconciles again.
//!
//! Run with: cargo run --example blog_schema -p oxide-reconcile

use oxide_reconcile::prelude::*;
use sqlx::sqlite::SqlitePoolOptions;

// =============================================================================
// Model Declarations
// =============================================================================

struct User;

impl Table for User {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("users")
            .column(
                ColumnDescriptor::new("id", SqlType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .column(
                ColumnDescriptor::new("username", SqlType::Text)
                    .not_null()
                    .collate("NOCASE"),
            )
            .column(ColumnDescriptor::new("email", SqlType::Text).not_null())
            .column(
                ColumnDescriptor::new("is_active", SqlType::Integer)
                    .not_null()
                    .default(DefaultValue::Bool(true)),
            )
            .index(IndexDescriptor::new(["username"]).unique())
    }
}

struct Post;

impl Table for Post {
    fn descriptor() -> TableDescriptor {
        TableDescriptor::new("posts")
            .column(
                ColumnDescriptor::new("id", SqlType::Integer)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnDescriptor::new("author_id", SqlType::Integer).not_null().indexed())
            .column(ColumnDescriptor::new("title", SqlType::Text).not_null())
            .column(ColumnDescriptor::new("body", SqlType::Text).not_null())
            .foreign_key(
                ForeignKeyDescriptor::new("author_id", "users", "id")
                    .on_delete(ForeignKeyAction::Cascade),
            )
    }
}

/// Second revision of the posts table: adds a nullable summary and makes the
/// body optional.
struct PostV2;

impl Table for PostV2 {
    fn descriptor() -> TableDescriptor {
        let mut table = Post::descriptor()
            .column(ColumnDescriptor::new("summary", SqlType::Text));
        if let Some(body) = table.columns.iter_mut().find(|c| c.name == "body") {
            body.nullable = true;
        }
        table
    }
}

// =============================================================================
// Main
// =============================================================================

fn print_report(label: &str, report: &MigrationReport) {
    println!("\n{label}: {} step(s)", report.plan.len());
    for event in &report.trace {
        println!("  {} {}", event.step_kind, event.table_name);
        for sql in &event.statements {
            println!("    {sql};");
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await?;
    let engine = MigrationEngine::new(pool.clone());

    // Posts are declared first; the engine still creates users before them.
    let v1 = SchemaSet::new().table::<Post>().table::<User>();
    let report = engine.migrate(v1.tables(), MigrateOptions::new()).await?;
    print_report("Initial schema", &report);

    sqlx::query("INSERT INTO users (username, email) VALUES ('ada', 'ada@example.com')")
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO posts (author_id, title, body) VALUES (1, 'Hello', 'First post')")
        .execute(&pool)
        .await?;

    let report = engine.migrate(v1.tables(), MigrateOptions::new()).await?;
    print_report("Unchanged schema", &report);

    let v2 = SchemaSet::new().table::<User>().table::<PostV2>();
    let plan = engine.plan(v2.tables(), MigrateOptions::new()).await?;
    println!("\nPlanned for revision 2:");
    for step in &plan {
        println!("  {step}");
    }

    let report = engine.migrate(v2.tables(), MigrateOptions::new()).await?;
    print_report("Revision 2", &report);

    let (title,): (String,) = sqlx::query_as("SELECT title FROM posts WHERE id = 1")
        .fetch_one(&pool)
        .await?;
    println!("\nPost 1 survived the rebuild: {title}");

    println!("\nStored fingerprints:");
    for record in engine.fingerprints().await? {
        println!("  {:<10} {}", record.table_name, record.fingerprint);
    }

    Ok(())
}
