// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::{execute, DbConnection};
use crate::migrator::versioned_schema_name;
use crate::schema::{Schema, Table};
use crate::sql::SqlWriter;
use anyhow::{Context, Result};

/// Idempotently (re)create the versioned view schema for `version`: one view
/// per table, projecting each physical column under its logical name.
///
/// Stale views from earlier refreshes are not pruned one by one; they vanish
/// when the whole versioned schema is dropped.
pub(crate) async fn create_views(
    conn: &DbConnection,
    schema: &str,
    version: &str,
    model: &Schema,
) -> Result<()> {
    let version_schema = versioned_schema_name(schema, version);

    let mut sql = SqlWriter::new();
    sql.write_str("CREATE SCHEMA IF NOT EXISTS ");
    sql.write_ident(&version_schema);
    execute(&conn.pool, sqlx::query(&sql.build())).await?;

    for (name, table) in model.tables.iter() {
        let ddl = view_ddl(schema, &version_schema, name, table);
        execute(&conn.pool, sqlx::query(&ddl))
            .await
            .with_context(|| format!("unable to create view for table {:?}", name))?;
    }
    Ok(())
}

/// Drop the versioned view schema for `version`, taking its views along.
pub(crate) async fn drop_views(conn: &DbConnection, schema: &str, version: &str) -> Result<()> {
    let mut sql = SqlWriter::new();
    sql.write_str("DROP SCHEMA IF EXISTS ");
    sql.write_ident(&versioned_schema_name(schema, version));
    sql.write_str(" CASCADE");
    execute(&conn.pool, sqlx::query(&sql.build())).await?;
    Ok(())
}

// Column order in the projection follows map iteration order and is not part
// of the contract.
fn view_ddl(schema: &str, version_schema: &str, name: &str, table: &Table) -> String {
    let mut sql = SqlWriter::new();
    sql.write_str("CREATE OR REPLACE VIEW ");
    sql.write_qualified(version_schema, name);
    sql.write_str(" AS SELECT ");
    for (i, (logical, column)) in table.columns.iter().enumerate() {
        if i > 0 {
            sql.write_str(", ");
        }
        sql.write_ident(&column.name);
        sql.write_str(" AS ");
        sql.write_ident(logical);
    }
    sql.write_str(" FROM ");
    sql.write_qualified(schema, &table.name);
    sql.build()
}
