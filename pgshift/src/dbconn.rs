// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use anyhow::{Context, Result};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Execute, Executor, Postgres};
use std::str::FromStr;

/// Connection used to apply migrations.
///
/// Every pooled connection carries a statement-level `lock_timeout` so that
/// DDL waiting on a conflicting lock fails fast instead of starving writers.
#[derive(Debug, Clone)]
pub(crate) struct DbConnection {
    pub(crate) pool: PgPool,
}

impl DbConnection {
    pub(crate) async fn connect(uri: &str, lock_timeout_ms: u64, nr_conn: usize) -> Result<Self> {
        let opts = PgConnectOptions::from_str(uri)?
            .options([("lock_timeout", lock_timeout_ms.to_string())]);
        let pool = PgPoolOptions::new()
            .max_connections(nr_conn as _)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to connect to {}", uri))?;
        Ok(Self { pool })
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) async fn execute<'a, E>(
    executor: E,
    query: Query<'a, Postgres, PgArguments>,
) -> Result<PgQueryResult>
where
    E: Executor<'a, Database = Postgres>,
{
    let qstr = query.sql();
    executor
        .execute(query)
        .await
        .with_context(|| format!("failed to execute query {}", qstr))
}

pub(crate) async fn fetch_one<'a, E>(
    executor: E,
    query: Query<'a, Postgres, PgArguments>,
) -> Result<PgRow>
where
    E: Executor<'a, Database = Postgres>,
{
    let qstr = query.sql();
    executor
        .fetch_one(query)
        .await
        .with_context(|| format!("failed to execute query {}", qstr))
}

pub(crate) async fn fetch_optional<'a, E>(
    executor: E,
    query: Query<'a, Postgres, PgArguments>,
) -> Result<Option<PgRow>>
where
    E: Executor<'a, Database = Postgres>,
{
    let qstr = query.sql();
    executor
        .fetch_optional(query)
        .await
        .with_context(|| format!("failed to execute query {}", qstr))
}

pub(crate) async fn fetch_all<'a, E>(
    executor: E,
    query: Query<'a, Postgres, PgArguments>,
) -> Result<Vec<PgRow>>
where
    E: Executor<'a, Database = Postgres>,
{
    let qstr = query.sql();
    query
        .fetch_all(executor)
        .await
        .with_context(|| format!("failed to execute query {}", qstr))
}
