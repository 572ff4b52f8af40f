// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::{execute, DbConnection};
use crate::schema::Schema;
use crate::sql::SqlWriter;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Removes a table, expand/contract style.
///
/// The start phase only removes the table from the new version's model, so
/// its view is never created there while the old version keeps serving it.
/// The physical drop waits until complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpDropTable {
    pub name: String,
}

impl OpDropTable {
    pub(crate) fn start(&self, current: &mut Schema) -> Result<()> {
        ensure!(
            current.get_table(&self.name).is_some(),
            "table {:?} is not in the schema model",
            self.name
        );
        current.remove_table(&self.name);
        Ok(())
    }

    pub(crate) async fn complete(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        let mut sql = SqlWriter::new();
        sql.write_str("DROP TABLE IF EXISTS ");
        sql.write_qualified(schema, &self.name);

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure!(
            schema.get_table(&self.name).is_some(),
            "table {:?} does not exist",
            self.name
        );
        Ok(())
    }
}
