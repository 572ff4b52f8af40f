// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::{write_column_def, ColumnDef};
use crate::dbconn::{execute, DbConnection};
use crate::schema::Schema;
use crate::sql::SqlWriter;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Adds a column to an existing table.
///
/// During the expand phase the column is added nullable unless a default
/// makes NOT NULL safe for existing rows; the constraint is tightened on
/// complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpAddColumn {
    pub table: String,
    pub column: ColumnDef,
}

impl OpAddColumn {
    /// Whether the NOT NULL constraint has to wait for the contract phase.
    fn deferred_not_null(&self) -> bool {
        !self.column.pk && !self.column.nullable && self.column.default.is_none()
    }

    pub(crate) async fn start(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        let mut sql = SqlWriter::new();
        sql.write_str("ALTER TABLE ");
        sql.write_qualified(schema, &self.table);
        sql.write_str(" ADD COLUMN ");
        if self.deferred_not_null() {
            let mut relaxed = self.column.clone();
            relaxed.nullable = true;
            write_column_def(&mut sql, &relaxed);
        } else {
            write_column_def(&mut sql, &self.column);
        }

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) async fn complete(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        if !self.deferred_not_null() {
            return Ok(());
        }

        // FIXME: SET NOT NULL fails if NULLs were written while the
        // migration was active; a backfill pass has to run first.
        let mut sql = SqlWriter::new();
        sql.write_str("ALTER TABLE ");
        sql.write_qualified(schema, &self.table);
        sql.write_str(" ALTER COLUMN ");
        sql.write_ident(&self.column.name);
        sql.write_str(" SET NOT NULL");

        execute(&conn.pool, sqlx::query(&sql.build()))
            .await
            .with_context(|| format!("could not tighten column {:?}", self.column.name))?;
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        let mut sql = SqlWriter::new();
        sql.write_str("ALTER TABLE IF EXISTS ");
        sql.write_qualified(schema, &self.table);
        sql.write_str(" DROP COLUMN IF EXISTS ");
        sql.write_ident(&self.column.name);

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure!(!self.column.pk, "cannot add a primary key column");
        let table = schema
            .get_table(&self.table)
            .with_context(|| format!("table {:?} does not exist", self.table))?;
        ensure!(
            table.get_column(&self.column.name).is_none(),
            "table {:?} already has a column {:?}",
            self.table,
            self.column.name
        );
        Ok(())
    }
}
