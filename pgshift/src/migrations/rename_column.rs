// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::column_exists;
use crate::dbconn::{execute, DbConnection};
use crate::schema::Schema;
use crate::sql::SqlWriter;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Renames a column, expand/contract style.
///
/// The start phase re-keys the logical name in the schema model only, so the
/// new version's views project the old physical column under the new name
/// while the old version keeps addressing it as before. The physical rename
/// happens on complete, once no version addresses the old name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRenameColumn {
    pub table: String,
    pub from: String,
    pub to: String,
}

impl OpRenameColumn {
    pub(crate) fn start(&self, current: &mut Schema) -> Result<()> {
        let table = current
            .get_table_mut(&self.table)
            .with_context(|| format!("table {:?} does not exist", self.table))?;
        ensure!(
            table.get_column(&self.to).is_none(),
            "table {:?} already has a column {:?}",
            self.table,
            self.to
        );
        ensure!(
            table.rename_column(&self.from, &self.to),
            "table {:?} has no column {:?}",
            self.table,
            self.from
        );
        Ok(())
    }

    pub(crate) async fn complete(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        // a retried complete may already have renamed the column
        if !column_exists(conn, schema, &self.table, &self.from).await? {
            return Ok(());
        }

        let mut sql = SqlWriter::new();
        sql.write_str("ALTER TABLE ");
        sql.write_qualified(schema, &self.table);
        sql.write_str(" RENAME COLUMN ");
        sql.write_ident(&self.from);
        sql.write_str(" TO ");
        sql.write_ident(&self.to);

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        // the column itself may be created by an earlier operation of the
        // same migration; only the table is checked here
        ensure!(
            schema.get_table(&self.table).is_some(),
            "table {:?} does not exist",
            self.table
        );
        Ok(())
    }
}
