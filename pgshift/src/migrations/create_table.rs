// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::{write_column_def, ColumnDef};
use crate::dbconn::{execute, DbConnection};
use crate::schema::Schema;
use crate::sql::SqlWriter;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Creates a new table. Purely additive: the table is visible to the new
/// version only once its view is materialised, so the start phase can create
/// it under its final name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpCreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl OpCreateTable {
    pub(crate) async fn start(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        execute(&conn.pool, sqlx::query(&self.ddl(schema))).await?;
        Ok(())
    }

    pub(crate) fn complete(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        let mut sql = SqlWriter::new();
        sql.write_str("DROP TABLE IF EXISTS ");
        sql.write_qualified(schema, &self.name);

        execute(&conn.pool, sqlx::query(&sql.build())).await?;
        Ok(())
    }

    pub(crate) fn validate(&self, schema: &Schema) -> Result<()> {
        ensure!(
            schema.get_table(&self.name).is_none(),
            "table {:?} already exists",
            self.name
        );
        ensure!(
            !self.columns.is_empty(),
            "table {:?} has no columns",
            self.name
        );
        Ok(())
    }

    fn ddl(&self, schema: &str) -> String {
        let mut sql = SqlWriter::new();
        sql.write_str("CREATE TABLE ");
        sql.write_qualified(schema, &self.name);
        sql.write_str(" (");
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                sql.write_str(", ");
            }
            write_column_def(&mut sql, col);
        }
        sql.write_str(")");
        sql.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_create_table_ddl() {
        let op: OpCreateTable = serde_json::from_value(json!({
            "name": "users",
            "columns": [
                {"name": "id", "type": "integer", "pk": true},
                {"name": "email", "type": "text", "nullable": true},
                {"name": "plan", "type": "text", "default": "free"}
            ]
        }))
        .unwrap();

        assert_eq!(
            op.ddl("public"),
            "CREATE TABLE \"public\".\"users\" (\"id\" integer PRIMARY KEY, \
             \"email\" text, \"plan\" text NOT NULL DEFAULT 'free')"
        );
    }
}
