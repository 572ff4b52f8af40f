// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::{execute, DbConnection};
use crate::schema::Schema;
use crate::sql::SqlWriter;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Removes a column, expand/contract style.
///
/// The start phase only hides the column from the new version's views; the
/// physical column keeps serving the old version until complete drops it.
/// Rolling back therefore has nothing to undo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDropColumn {
    pub table: String,
    pub column: String,
}

impl OpDropColumn {
    pub(crate) fn start(&self, original: &Schema, current: &mut Schema) -> Result<()> {
        let existed = original
            .get_table(&self.table)
            .map_or(false, |t| t.get_column(&self.column).is_some());
        ensure!(
            existed,
            "column {:?} of table {:?} did not exist before this migration",
            self.column,
            self.table
        );

        let table = current
            .get_table_mut(&self.table)
            .with_context(|| format!("table {:?} does not exist", self.table))?;
        table
            .remove_column(&self.column)
            .with_context(|| format!("column {:?} is not in the schema model", self.column))?;
        Ok(())
    }

    pub(crate) async fn complete(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        let mut sql = SqlWriter::new();
        sql.write_str("ALTER TABLE ");
        sql.write_qualified(schema, &self.table);
        sql.write_str(" DROP COLUMN IF EXISTS ");
        sql.write_ident(&self.column);

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        Ok(())
    }

    /// Contract operations only drop what predates the migration, so the
    /// column is required in `original` too, matching the start phase.
    pub(crate) fn validate(&self, original: &Schema, schema: &Schema) -> Result<()> {
        let table = schema
            .get_table(&self.table)
            .with_context(|| format!("table {:?} does not exist", self.table))?;
        ensure!(
            table.get_column(&self.column).is_some(),
            "table {:?} has no column {:?}",
            self.table,
            self.column
        );
        ensure!(
            original
                .get_table(&self.table)
                .map_or(false, |t| t.get_column(&self.column).is_some()),
            "column {:?} of table {:?} did not exist before this migration",
            self.column,
            self.table
        );
        Ok(())
    }
}
