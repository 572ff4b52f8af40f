// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! End-to-end migration scenarios against a live Postgres.
//!
//! Set POSTGRES_URL to run these; without it every test is a silent skip.
//! Each test works in its own logical schema (plus a private state schema
//! derived from it), so the suite can run in parallel against one database.

use pgshift::migrations::Migration;
use pgshift::{versioned_schema_name, ErrorKind, Migrator, Phase, State};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::env;

struct TestDb {
    url: String,
    pool: PgPool,
    schema: String,
}

async fn setup(schema: &str) -> Option<TestDb> {
    let url = match env::var("POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("POSTGRES_URL not set, skipping");
            return None;
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .unwrap();

    // drop everything a previous run may have left behind: the logical
    // schema, its state schema and any versioned view schemas
    let leftovers = sqlx::query(
        "SELECT nspname::text FROM pg_namespace WHERE nspname = $1 OR nspname LIKE $2",
    )
    .bind(schema)
    .bind(format!("{}\\_%", schema))
    .fetch_all(&pool)
    .await
    .unwrap();
    for row in leftovers {
        let name: String = row.get(0);
        sqlx::query(&format!("DROP SCHEMA \"{}\" CASCADE", name))
            .execute(&pool)
            .await
            .unwrap();
    }
    sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema))
        .execute(&pool)
        .await
        .unwrap();

    let state = State::connect(&url, &state_schema(schema)).await.unwrap();
    state.init().await.unwrap();

    Some(TestDb {
        url,
        pool,
        schema: schema.to_owned(),
    })
}

fn state_schema(schema: &str) -> String {
    format!("{}_state", schema)
}

impl TestDb {
    async fn migrator(&self) -> Migrator {
        let state = State::connect(&self.url, &state_schema(&self.schema))
            .await
            .unwrap();
        Migrator::new(&self.url, &self.schema, 500, state).await.unwrap()
    }

    async fn state(&self) -> State {
        State::connect(&self.url, &state_schema(&self.schema))
            .await
            .unwrap()
    }
}

fn migration(value: serde_json::Value) -> Migration {
    serde_json::from_value(value).unwrap()
}

fn create_users(name: &str) -> Migration {
    migration(json!({
        "name": name,
        "operations": [
            {"create_table": {"name": "users", "columns": [
                {"name": "id", "type": "integer", "pk": true}
            ]}}
        ]
    }))
}

async fn schema_exists(pool: &PgPool, name: &str) -> bool {
    sqlx::query("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
        .get(0)
}

async fn column_exists(pool: &PgPool, schema: &str, table: &str, column: &str) -> bool {
    sqlx::query(
        "SELECT EXISTS (
            SELECT 1 FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
        )",
    )
    .bind(schema)
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .unwrap()
    .get(0)
}

#[tokio::test]
async fn fresh_migration_end_to_end() {
    let db = match setup("shift_fresh").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;

    migrator.start(&create_users("m1"), &[]).await.unwrap();
    let version = versioned_schema_name(&db.schema, "m1");
    assert!(schema_exists(&db.pool, &version).await);
    assert!(column_exists(&db.pool, &version, "users", "id").await);

    migrator.complete().await.unwrap();
    assert!(schema_exists(&db.pool, &version).await);

    // the versioned view is writable and readable
    sqlx::query(&format!("INSERT INTO \"{}\".\"users\" (\"id\") VALUES (1)", version))
        .execute(&db.pool)
        .await
        .unwrap();
    let rows = sqlx::query(&format!("SELECT \"id\" FROM \"{}\".\"users\"", version))
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get::<i32, _>("id"), 1);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let db = match setup("shift_double").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    migrator.start(&create_users("m1"), &[]).await.unwrap();

    let m2 = migration(json!({
        "name": "m2",
        "operations": [
            {"create_table": {"name": "orders", "columns": [{"name": "id", "type": "integer", "pk": true}]}}
        ]
    }));
    let mut second = db.migrator().await;
    let err = second.start(&m2, &[]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::MigrationInProgress);

    // state unchanged: m1 is still the active migration
    let active = db.state().await.get_active_migration(&db.schema).await.unwrap();
    assert_eq!(active.name, "m1");
}

#[tokio::test]
async fn failed_operation_triggers_rollback() {
    let db = match setup("shift_failed").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;

    let m2 = migration(json!({
        "name": "m2",
        "operations": [
            {"create_table": {"name": "widgets", "columns": [{"name": "id", "type": "integer", "pk": true}]}},
            {"raw_sql": {"up": "THIS IS NOT SQL"}}
        ]
    }));
    let err = migrator.start(&m2, &[]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Operation(Phase::Start));

    // the rollback undid everything: no view schema, no table, no claim
    assert!(!schema_exists(&db.pool, &versioned_schema_name(&db.schema, "m2")).await);
    assert!(!column_exists(&db.pool, &db.schema, "widgets", "id").await);
    assert!(!db
        .state()
        .await
        .is_active_migration_period(&db.schema)
        .await
        .unwrap());
}

#[tokio::test]
async fn refreshed_schema_is_visible_to_later_operations() {
    let db = match setup("shift_refresh").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    migrator.start(&create_users("m1"), &[]).await.unwrap();
    migrator.complete().await.unwrap();

    // the first operation advertises a schema refresh, so the rename sees
    // the freshly added column
    let m3 = migration(json!({
        "name": "m3",
        "operations": [
            {"add_column": {"table": "users", "column": {"name": "email", "type": "text", "nullable": true}}},
            {"rename_column": {"table": "users", "from": "email", "to": "email_addr"}}
        ]
    }));
    migrator.start(&m3, &[]).await.unwrap();

    let version = versioned_schema_name(&db.schema, "m3");
    assert!(column_exists(&db.pool, &version, "users", "email_addr").await);

    // the view projects the physical column created in the first operation
    sqlx::query(&format!(
        "INSERT INTO \"{}\".\"users\" (\"id\", \"email\") VALUES (1, 'a@b.c')",
        db.schema
    ))
    .execute(&db.pool)
    .await
    .unwrap();
    let row = sqlx::query(&format!(
        "SELECT \"email_addr\" FROM \"{}\".\"users\"",
        version
    ))
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(row.get::<String, _>("email_addr"), "a@b.c");
}

#[tokio::test]
async fn completing_drops_the_previous_version() {
    let db = match setup("shift_prevdrop").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    migrator.start(&create_users("m1"), &[]).await.unwrap();
    migrator.complete().await.unwrap();

    let m2 = migration(json!({
        "name": "m2",
        "operations": [
            {"add_column": {"table": "users", "column": {"name": "email", "type": "text", "nullable": true}}}
        ]
    }));
    migrator.start(&m2, &[]).await.unwrap();
    migrator.complete().await.unwrap();

    assert!(!schema_exists(&db.pool, &versioned_schema_name(&db.schema, "m1")).await);
    assert!(schema_exists(&db.pool, &versioned_schema_name(&db.schema, "m2")).await);
}

#[tokio::test]
async fn rollback_after_complete_is_an_error() {
    let db = match setup("shift_rbterm").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    migrator.start(&create_users("m1"), &[]).await.unwrap();
    migrator.complete().await.unwrap();

    let err = migrator.rollback().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoActiveMigration);
}

#[tokio::test]
async fn rolled_back_migration_can_be_restarted() {
    let db = match setup("shift_restart").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    let m1 = create_users("m1");

    migrator.start(&m1, &[]).await.unwrap();
    migrator.rollback().await.unwrap();
    assert!(!schema_exists(&db.pool, &versioned_schema_name(&db.schema, "m1")).await);

    // same end state as a straight start + complete
    migrator.start(&m1, &[]).await.unwrap();
    migrator.complete().await.unwrap();
    assert!(schema_exists(&db.pool, &versioned_schema_name(&db.schema, "m1")).await);
    assert!(column_exists(&db.pool, &db.schema, "users", "id").await);
}

#[tokio::test]
async fn completed_names_cannot_be_reused() {
    let db = match setup("shift_dupname").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    migrator.start(&create_users("m1"), &[]).await.unwrap();
    migrator.complete().await.unwrap();

    let m1_again = migration(json!({
        "name": "m1",
        "operations": [
            {"create_table": {"name": "orders", "columns": [{"name": "id", "type": "integer", "pk": true}]}}
        ]
    }));
    let err = migrator.start(&m1_again, &[]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DuplicateMigrationName);
}

#[tokio::test]
async fn dropped_column_serves_the_old_version_until_complete() {
    let db = match setup("shift_dropcol").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    let m1 = migration(json!({
        "name": "m1",
        "operations": [
            {"create_table": {"name": "users", "columns": [
                {"name": "id", "type": "integer", "pk": true},
                {"name": "email", "type": "text", "nullable": true}
            ]}}
        ]
    }));
    migrator.start(&m1, &[]).await.unwrap();
    migrator.complete().await.unwrap();

    let m2 = migration(json!({
        "name": "m2",
        "operations": [{"drop_column": {"table": "users", "column": "email"}}]
    }));
    migrator.start(&m2, &[]).await.unwrap();

    // hidden from the new version, still present physically
    let version = versioned_schema_name(&db.schema, "m2");
    assert!(!column_exists(&db.pool, &version, "users", "email").await);
    assert!(column_exists(&db.pool, &db.schema, "users", "email").await);

    migrator.complete().await.unwrap();
    assert!(!column_exists(&db.pool, &db.schema, "users", "email").await);
}

#[tokio::test]
async fn dropped_table_loses_its_view_but_not_its_data() {
    let db = match setup("shift_droptab").await {
        Some(db) => db,
        None => return,
    };
    let mut migrator = db.migrator().await;
    let m1 = migration(json!({
        "name": "m1",
        "operations": [
            {"create_table": {"name": "users", "columns": [{"name": "id", "type": "integer", "pk": true}]}},
            {"create_table": {"name": "orders", "columns": [{"name": "id", "type": "integer", "pk": true}]}}
        ]
    }));
    migrator.start(&m1, &[]).await.unwrap();
    migrator.complete().await.unwrap();

    let m2 = migration(json!({
        "name": "m2",
        "operations": [{"drop_table": {"name": "orders"}}]
    }));
    migrator.start(&m2, &[]).await.unwrap();

    // no view in the new version, old version and data untouched
    let version = versioned_schema_name(&db.schema, "m2");
    assert!(column_exists(&db.pool, &version, "users", "id").await);
    assert!(!column_exists(&db.pool, &version, "orders", "id").await);
    assert!(column_exists(&db.pool, &db.schema, "orders", "id").await);

    migrator.complete().await.unwrap();
    assert!(!column_exists(&db.pool, &db.schema, "orders", "id").await);
}

#[tokio::test]
async fn overlapping_starts_have_a_single_winner() {
    let db = match setup("shift_race").await {
        Some(db) => db,
        None => return,
    };
    let mut first = db.migrator().await;
    let mut second = db.migrator().await;

    let m_a = create_users("m_a");
    let m_b = migration(json!({
        "name": "m_b",
        "operations": [
            {"create_table": {"name": "orders", "columns": [{"name": "id", "type": "integer", "pk": true}]}}
        ]
    }));

    let (a, b) = tokio::join!(first.start(&m_a, &[]), second.start(&m_b, &[]));
    let failures: Vec<_> = [a, b].into_iter().filter_map(|r| r.err()).collect();
    assert_eq!(failures.len(), 1, "exactly one start must lose");
    assert_eq!(failures[0].kind, ErrorKind::MigrationInProgress);
}
