// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::DbConnection;
use crate::error::{Error, Phase, Result, ResultExt};
use crate::migrations::{CallbackFn, Migration};
use crate::state::State;
use crate::views;
use anyhow::Context;

/// Coordinates the expand/contract protocol for one logical schema.
///
/// A migration runs through a two-phase lifecycle: [Migrator::start] makes
/// the additive changes and materialises a versioned view schema so old and
/// new application versions address the same tables concurrently;
/// [Migrator::complete] performs the deferred destructive changes and
/// retires the previous version's views; [Migrator::rollback] is the
/// alternative terminal, undoing the expand phase.
///
/// One migrator instance serves one caller at a time. Safety across
/// processes does not come from this type: it comes from the state store,
/// whose claim is guarded by a uniqueness constraint, so the advisory check
/// at the top of [Migrator::start] can race without harm.
pub struct Migrator {
    conn: DbConnection,
    schema: String,
    state: State,
}

/// Name of the database schema holding `version`'s views of `schema`: the
/// two parts joined by an underscore, quoted individually where emitted.
pub fn versioned_schema_name(schema: &str, version: &str) -> String {
    format!("{}_{}", schema, version)
}

impl Migrator {
    /// Connect a migrator for `schema`. `lock_timeout_ms` is applied to
    /// every connection so blocking DDL fails fast instead of queueing
    /// behind long-running transactions.
    pub async fn new(
        uri: &str,
        schema: &str,
        lock_timeout_ms: u64,
        state: State,
    ) -> Result<Migrator> {
        let conn = DbConnection::connect(uri, lock_timeout_ms, 1).await.err_db()?;
        Ok(Migrator {
            conn,
            schema: schema.to_owned(),
            state,
        })
    }

    /// Apply the expand phase of `migration`.
    ///
    /// On success the migration is active and the versioned view schema for
    /// it exists. If an operation fails midway, the already-applied
    /// operations are rolled back and the returned error carries both the
    /// operation failure and the rollback outcome.
    pub async fn start(&mut self, migration: &Migration, cbs: &[CallbackFn]) -> Result<()> {
        // fast-path check; the state store's claim below is the
        // authoritative guard
        if self.state.is_active_migration_period(&self.schema).await? {
            return Err(Error::migration_in_progress(&self.schema));
        }

        let original = self.state.start(&self.schema, migration).await?;

        if let Err(err) = migration.validate(&original) {
            // the validation error dominates; the state store outcome only
            // goes to the log
            if let Err(rollback_err) = self.state.rollback(&self.schema, &migration.name).await {
                error!(
                    "failed to roll back migration {}: {}",
                    migration.name, rollback_err
                );
            }
            return Err(Error::invalid_migration(err));
        }

        let mut current = original.clone();
        for op in &migration.operations {
            if let Err(err) = op
                .start(&self.conn, &self.schema, &original, &mut current, cbs)
                .await
            {
                let primary = Error::operation(
                    Phase::Start,
                    err.context(format!("unable to start {} operation", op.name())),
                );
                return Err(match self.rollback().await {
                    Ok(()) => primary,
                    Err(rollback_err) => Error::join(primary, rollback_err),
                });
            }

            if op.requires_schema_refresh() {
                current = self.state.read_schema(&self.schema).await?;
            }
        }

        views::create_views(&self.conn, &self.schema, &migration.name, &current)
            .await
            .err_db()?;
        Ok(())
    }

    /// Apply the contract phase of the active migration.
    ///
    /// The previous version's view schema is dropped first: this is the
    /// point where the old application version loses its surface. A failing
    /// operation aborts with the migration still active, and since
    /// operations' complete phases are idempotent, complete can simply be
    /// retried.
    pub async fn complete(&mut self) -> Result<()> {
        let migration = self.state.get_active_migration(&self.schema).await?;

        if let Some(previous) = self.state.previous_version(&self.schema).await? {
            views::drop_views(&self.conn, &self.schema, &previous)
                .await
                .context("unable to drop views of the previous version")
                .err_db()?;
        }

        for op in &migration.operations {
            op.complete(&self.conn, &self.schema).await.map_err(|err| {
                Error::operation(
                    Phase::Complete,
                    err.context(format!("unable to complete {} operation", op.name())),
                )
            })?;
        }

        self.state.complete(&self.schema, &migration.name).await?;
        Ok(())
    }

    /// Undo the active migration: drop its view schema, roll every
    /// operation back in declared order, and forget the claim. Operations
    /// that never started roll back as no-ops, so a partially-started
    /// migration is handled the same way.
    pub async fn rollback(&mut self) -> Result<()> {
        let migration = self.state.get_active_migration(&self.schema).await?;

        views::drop_views(&self.conn, &self.schema, &migration.name)
            .await
            .err_db()?;

        for op in &migration.operations {
            op.rollback(&self.conn, &self.schema).await.map_err(|err| {
                Error::operation(
                    Phase::Rollback,
                    err.context(format!("unable to roll back {} operation", op.name())),
                )
            })?;
        }

        self.state.rollback(&self.schema, &migration.name).await?;
        Ok(())
    }

    /// Close the migrator's own connections. The state store keeps its
    /// pool.
    pub async fn close(self) -> Result<()> {
        self.conn.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_schema_names_join_with_underscore() {
        assert_eq!(versioned_schema_name("public", "m1"), "public_m1");
        // no escaping here; quoting happens where the name is emitted
        assert_eq!(
            versioned_schema_name("app", "2023_06_add_users"),
            "app_2023_06_add_users"
        );
    }
}
