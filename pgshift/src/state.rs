// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::{execute, fetch_all, fetch_optional};
use crate::error::{Error, Result, ResultExt};
use crate::migrations::Migration;
use crate::schema::{Column, Schema, Table};
use crate::sql::quote_ident;
use anyhow::Context;
use sqlx::postgres::{PgDatabaseError, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Row};

/// Name of the partial unique index that allows only one in-flight
/// migration per logical schema.
const ONLY_ONE_ACTIVE: &str = "only_one_active";

/// Name of the primary key constraint on the migrations table.
const MIGRATIONS_PKEY: &str = "migrations_pkey";

/// Persistent record of migrations, kept in its own schema.
///
/// The store is the authority on the single-active invariant: claiming a
/// migration is one INSERT guarded by a partial unique index, so two
/// concurrent claims cannot both succeed regardless of what their callers
/// observed beforehand.
#[derive(Debug, Clone)]
pub struct State {
    pool: PgPool,
    schema: String,
}

impl State {
    pub async fn connect(uri: &str, schema: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(uri)
            .await
            .with_context(|| format!("failed to connect to {}", uri))
            .err_state()?;
        Ok(Self {
            pool,
            schema: schema.to_owned(),
        })
    }

    /// Create the state schema and its tables. Safe to call repeatedly.
    pub async fn init(&self) -> Result<()> {
        let q = quote_ident(&self.schema);

        let mut transaction = self.pool.begin().await.err_state()?;
        execute(
            &mut transaction,
            sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", q)),
        )
        .await
        .err_state()?;

        execute(
            &mut transaction,
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {q}.migrations (
                    schema NAME NOT NULL,
                    name TEXT NOT NULL,
                    migration JSONB NOT NULL,
                    parent TEXT,
                    done BOOLEAN NOT NULL DEFAULT false,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (schema, name),
                    FOREIGN KEY (schema, parent) REFERENCES {q}.migrations (schema, name)
                )"#
            )),
        )
        .await
        .err_state()?;

        execute(
            &mut transaction,
            sqlx::query(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}.migrations (schema) WHERE NOT done",
                quote_ident(ONLY_ONE_ACTIVE),
                q
            )),
        )
        .await
        .err_state()?;

        transaction.commit().await.err_state()?;
        Ok(())
    }

    pub async fn is_active_migration_period(&self, schema: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {}.migrations WHERE schema = $1 AND NOT done)",
            quote_ident(&self.schema)
        );
        let row = fetch_optional(&self.pool, sqlx::query(&sql).bind(schema))
            .await
            .err_state()?;
        Ok(row.map_or(false, |row| row.get(0)))
    }

    pub async fn get_active_migration(&self, schema: &str) -> Result<Migration> {
        let sql = format!(
            "SELECT migration FROM {}.migrations WHERE schema = $1 AND NOT done",
            quote_ident(&self.schema)
        );
        match fetch_optional(&self.pool, sqlx::query(&sql).bind(schema))
            .await
            .err_state()?
        {
            Some(row) => {
                let Json(migration) = row
                    .try_get::<Json<Migration>, _>("migration")
                    .context("could not decode stored migration")
                    .err_state()?;
                Ok(migration)
            }
            None => Err(Error::no_active_migration(schema)),
        }
    }

    /// Record `migration` as active for `schema` and return a fresh model of
    /// the schema as it stands at the moment of the claim. Claim and
    /// snapshot run in one transaction.
    ///
    /// The insert is the authoritative guard: losing the race surfaces as
    /// [ErrorKind::MigrationInProgress](crate::ErrorKind::MigrationInProgress),
    /// a recycled name as
    /// [ErrorKind::DuplicateMigrationName](crate::ErrorKind::DuplicateMigrationName).
    pub async fn start(&self, schema: &str, migration: &Migration) -> Result<Schema> {
        let q = quote_ident(&self.schema);
        let sql = format!(
            r#"
            INSERT INTO {q}.migrations (schema, name, parent, migration)
            VALUES (
                $1, $2,
                (SELECT name FROM {q}.migrations WHERE schema = $1 ORDER BY created_at DESC LIMIT 1),
                $3
            )"#
        );

        let mut transaction = self.pool.begin().await.err_state()?;
        let claim = sqlx::query(&sql)
            .bind(schema)
            .bind(&migration.name)
            .bind(Json(migration));
        if let Err(err) = claim.execute(&mut transaction).await {
            return Err(claim_error(schema, &migration.name, err));
        }
        let model = read_schema_from(&mut transaction, schema).await?;
        transaction.commit().await.err_state()?;
        Ok(model)
    }

    /// Mark the active migration as done. The record stays as history.
    pub async fn complete(&self, schema: &str, name: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {}.migrations SET done = true, updated_at = now()
             WHERE schema = $1 AND name = $2 AND NOT done",
            quote_ident(&self.schema)
        );
        let result = execute(&self.pool, sqlx::query(&sql).bind(schema).bind(name))
            .await
            .err_state()?;
        if result.rows_affected() != 1 {
            return Err(Error::state(anyhow::anyhow!(
                "migration {:?} is not active for schema {:?}",
                name,
                schema
            )));
        }
        Ok(())
    }

    /// Forget the active migration. A no-op if it was already removed.
    pub async fn rollback(&self, schema: &str, name: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {}.migrations WHERE schema = $1 AND name = $2 AND NOT done",
            quote_ident(&self.schema)
        );
        execute(&self.pool, sqlx::query(&sql).bind(schema).bind(name))
            .await
            .err_state()?;
        Ok(())
    }

    /// Name of the version the active migration supersedes, if any.
    pub async fn previous_version(&self, schema: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT parent FROM {}.migrations WHERE schema = $1 AND NOT done",
            quote_ident(&self.schema)
        );
        let row = fetch_optional(&self.pool, sqlx::query(&sql).bind(schema))
            .await
            .err_state()?;
        Ok(row.and_then(|row| row.get("parent")))
    }

    /// Name of the latest completed version, if any.
    pub async fn latest_version(&self, schema: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT name FROM {}.migrations
             WHERE schema = $1 AND done ORDER BY created_at DESC LIMIT 1",
            quote_ident(&self.schema)
        );
        let row = fetch_optional(&self.pool, sqlx::query(&sql).bind(schema))
            .await
            .err_state()?;
        Ok(row.map(|row| row.get("name")))
    }

    /// Build a fresh schema model from the database catalog. Every column
    /// starts out keyed under its physical name.
    pub async fn read_schema(&self, schema: &str) -> Result<Schema> {
        read_schema_from(&self.pool, schema).await
    }
}

async fn read_schema_from<'a, E>(executor: E, schema: &'a str) -> Result<Schema>
where
    E: Executor<'a, Database = Postgres>,
{
    let query = sqlx::query(
        r#"
        SELECT
            c.table_name::text AS table_name,
            c.column_name::text AS column_name,
            c.data_type::text AS data_type,
            c.is_nullable::text AS is_nullable
        FROM information_schema.columns c
        JOIN information_schema.tables t
            ON t.table_schema = c.table_schema AND t.table_name = c.table_name
        WHERE c.table_schema = $1 AND t.table_type = 'BASE TABLE'
        ORDER BY c.table_name, c.ordinal_position"#,
    )
    .bind(schema);
    let rows = fetch_all(executor, query).await.err_state()?;

    let mut model = Schema::new(schema);
    for row in rows {
        let table_name: &str = row.get("table_name");
        let column_name: &str = row.get("column_name");
        let data_type: &str = row.get("data_type");
        let is_nullable: &str = row.get("is_nullable");

        let table = model
            .tables
            .entry(table_name.to_owned())
            .or_insert_with(|| Table::new(table_name));
        table.add_column(
            column_name,
            Column {
                name: column_name.to_owned(),
                data_type: data_type.to_owned(),
                nullable: is_nullable == "YES",
            },
        );
    }
    debug!("read schema {:?}: {} tables", schema, model.tables.len());
    Ok(model)
}

fn claim_error(schema: &str, name: &str, err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = err {
        if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
            // 23505 = unique_violation; the violated constraint tells the
            // precondition apart
            if pg.code() == "23505" {
                match pg.constraint() {
                    Some(ONLY_ONE_ACTIVE) => return Error::migration_in_progress(schema),
                    Some(MIGRATIONS_PKEY) => return Error::duplicate_migration_name(schema, name),
                    _ => {}
                }
            }
        }
    }
    Error::state(anyhow::Error::new(err).context("unable to record migration start"))
}
