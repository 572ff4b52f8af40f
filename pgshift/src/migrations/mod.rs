// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::dbconn::{fetch_one, DbConnection};
use crate::schema::{Column, Schema, Table};
use crate::sql::SqlWriter;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;

mod add_column;
mod create_table;
mod drop_column;
mod drop_table;
mod raw_sql;
mod rename_column;

pub use self::add_column::OpAddColumn;
pub use self::create_table::OpCreateTable;
pub use self::drop_column::OpDropColumn;
pub use self::drop_table::OpDropTable;
pub use self::raw_sql::OpRawSql;
pub use self::rename_column::OpRenameColumn;

/// Observer invoked by operations that touch rows, with the affected count.
pub type CallbackFn = Box<dyn Fn(i64) + Send + Sync>;

/// A named, ordered list of operations evolving a logical schema from one
/// version to the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub name: String,
    pub operations: Vec<Operation>,
}

impl Migration {
    /// Check the migration against a model of the schema it will run
    /// against. Each operation is validated against the model as evolved by
    /// the operations before it, the same way start threads its changes.
    /// Effects validation cannot see (raw SQL) stay invisible, so checks
    /// that could be defeated by them are deferred to start.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        ensure!(!self.name.is_empty(), "migration name must not be empty");
        ensure!(
            !self.operations.is_empty(),
            "migration {:?} has no operations",
            self.name
        );
        let mut working = schema.clone();
        for op in &self.operations {
            op.validate(schema, &working)
                .with_context(|| format!("{} operation is invalid", op.name()))?;
            op.apply_to_model(&mut working);
        }
        Ok(())
    }
}

/// A single schema change, serialized externally tagged:
/// `{"add_column": {...}}`.
///
/// Every operation implements the three-phase contract: `start` makes the
/// additive change, `complete` performs the deferred destructive part and
/// must be idempotent, `rollback` undoes `start` and must tolerate an
/// operation that never ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateTable(OpCreateTable),
    DropTable(OpDropTable),
    AddColumn(OpAddColumn),
    DropColumn(OpDropColumn),
    RenameColumn(OpRenameColumn),
    RawSql(OpRawSql),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateTable(_) => "create_table",
            Operation::DropTable(_) => "drop_table",
            Operation::AddColumn(_) => "add_column",
            Operation::DropColumn(_) => "drop_column",
            Operation::RenameColumn(_) => "rename_column",
            Operation::RawSql(_) => "raw_sql",
        }
    }

    /// Whether the migrator must re-read the schema model after this
    /// operation's start phase to observe structural changes.
    pub(crate) fn requires_schema_refresh(&self) -> bool {
        matches!(
            self,
            Operation::CreateTable(_) | Operation::AddColumn(_) | Operation::RawSql(_)
        )
    }

    pub(crate) async fn start(
        &self,
        conn: &DbConnection,
        schema: &str,
        original: &Schema,
        current: &mut Schema,
        cbs: &[CallbackFn],
    ) -> Result<()> {
        match self {
            Operation::CreateTable(op) => op.start(conn, schema).await,
            Operation::DropTable(op) => op.start(current),
            Operation::AddColumn(op) => op.start(conn, schema).await,
            Operation::DropColumn(op) => op.start(original, current),
            Operation::RenameColumn(op) => op.start(current),
            Operation::RawSql(op) => op.start(conn, cbs).await,
        }
    }

    pub(crate) async fn complete(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        match self {
            Operation::CreateTable(op) => op.complete(),
            Operation::DropTable(op) => op.complete(conn, schema).await,
            Operation::AddColumn(op) => op.complete(conn, schema).await,
            Operation::DropColumn(op) => op.complete(conn, schema).await,
            Operation::RenameColumn(op) => op.complete(conn, schema).await,
            Operation::RawSql(op) => op.complete(),
        }
    }

    pub(crate) async fn rollback(&self, conn: &DbConnection, schema: &str) -> Result<()> {
        match self {
            Operation::CreateTable(op) => op.rollback(conn, schema).await,
            Operation::DropTable(op) => op.rollback(),
            Operation::AddColumn(op) => op.rollback(conn, schema).await,
            Operation::DropColumn(op) => op.rollback(),
            Operation::RenameColumn(op) => op.rollback(),
            Operation::RawSql(op) => op.rollback(conn).await,
        }
    }

    /// `original` is the model before any operation of the migration;
    /// `schema` is the model as evolved by the operations validated so far.
    fn validate(&self, original: &Schema, schema: &Schema) -> Result<()> {
        match self {
            Operation::CreateTable(op) => op.validate(schema),
            Operation::DropTable(op) => op.validate(schema),
            Operation::AddColumn(op) => op.validate(schema),
            Operation::DropColumn(op) => op.validate(original, schema),
            Operation::RenameColumn(op) => op.validate(schema),
            Operation::RawSql(op) => op.validate(),
        }
    }

    /// Replay the operation's structural effect on a model, so validation
    /// walks the operation list the way start will. Best effort: anything
    /// validation could not prove is left alone.
    fn apply_to_model(&self, model: &mut Schema) {
        match self {
            Operation::CreateTable(op) => {
                let mut table = Table::new(&op.name);
                for col in &op.columns {
                    table.add_column(&col.name, col.to_column());
                }
                model.add_table(table);
            }
            Operation::DropTable(op) => model.remove_table(&op.name),
            Operation::AddColumn(op) => {
                if let Some(table) = model.get_table_mut(&op.table) {
                    table.add_column(&op.column.name, op.column.to_column());
                }
            }
            Operation::DropColumn(op) => {
                if let Some(table) = model.get_table_mut(&op.table) {
                    table.remove_column(&op.column);
                }
            }
            Operation::RenameColumn(op) => {
                if let Some(table) = model.get_table_mut(&op.table) {
                    table.rename_column(&op.from, &op.to);
                }
            }
            Operation::RawSql(_) => {}
        }
    }
}

/// Declaration of a column in a create-table or add-column operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub pk: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl ColumnDef {
    fn to_column(&self) -> Column {
        Column {
            name: self.name.clone(),
            data_type: self.data_type.clone(),
            nullable: self.nullable && !self.pk,
        }
    }
}

pub(crate) fn write_column_def(sql: &mut SqlWriter, col: &ColumnDef) {
    sql.write_ident(&col.name);
    sql.write_str(" ");
    sql.write_str(&col.data_type);
    if col.pk {
        sql.write_str(" PRIMARY KEY");
    } else if !col.nullable {
        sql.write_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        sql.write_str(" DEFAULT ");
        sql.write_literal(default);
    }
}

pub(crate) async fn column_exists(
    conn: &DbConnection,
    schema: &str,
    table: &str,
    column: &str,
) -> Result<bool> {
    let query = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
        )"#,
    )
    .bind(schema)
    .bind(table)
    .bind(column);
    let row = fetch_one(&conn.pool, query).await?;
    Ok(row.get(0))
}
