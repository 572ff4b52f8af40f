// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::CallbackFn;
use crate::dbconn::{execute, DbConnection};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

/// Escape hatch: runs caller-provided SQL.
///
/// `up` runs during start; `down`, when given, runs during rollback. The
/// statements are trusted as-is, so a migration using this operation is only
/// as reversible as its `down` makes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRawSql {
    pub up: String,
    #[serde(default)]
    pub down: Option<String>,
}

impl OpRawSql {
    pub(crate) async fn start(&self, conn: &DbConnection, cbs: &[CallbackFn]) -> Result<()> {
        let result = execute(&conn.pool, sqlx::query(&self.up))
            .await
            .context("raw up statement failed")?;
        for cb in cbs {
            cb(result.rows_affected() as i64);
        }
        Ok(())
    }

    pub(crate) fn complete(&self) -> Result<()> {
        Ok(())
    }

    pub(crate) async fn rollback(&self, conn: &DbConnection) -> Result<()> {
        if let Some(down) = &self.down {
            execute(&conn.pool, sqlx::query(down))
                .await
                .context("raw down statement failed")?;
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(!self.up.is_empty(), "up statement must not be empty");
        Ok(())
    }
}
