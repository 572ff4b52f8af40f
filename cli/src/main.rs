// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

#[macro_use]
extern crate log;

use anyhow::{Context, Result};
use pgshift::migrations::Migration;
use pgshift::{ErrorKind, Migrator, State};
use std::fs;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Zero-downtime schema migrations for Postgres.
#[derive(StructOpt, Debug)]
#[structopt(name = "pgshift")]
struct Opt {
    /// Postgres connection string.
    #[structopt(long, env = "POSTGRES_URL")]
    postgres_url: String,
    /// Logical schema the migrations target.
    #[structopt(long, default_value = "public")]
    schema: String,
    /// Schema holding the migration state.
    #[structopt(long, default_value = "pgshift")]
    state_schema: String,
    /// Statement lock timeout (milliseconds) for migration DDL.
    #[structopt(long, default_value = "500")]
    lock_timeout: u64,
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt, Debug)]
enum Cmd {
    /// Prepare the state schema. Safe to run repeatedly.
    Init,
    /// Start a migration from a JSON definition file.
    Start {
        /// Path to the migration file.
        file: PathBuf,
        /// Complete the migration immediately after starting it.
        #[structopt(long)]
        complete: bool,
    },
    /// Complete the active migration.
    Complete,
    /// Roll back the active migration.
    Rollback,
    /// Show the latest and active versions of the schema.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    let state = State::connect(&opt.postgres_url, &opt.state_schema).await?;
    match opt.cmd {
        Cmd::Init => {
            state.init().await?;
            info!("state schema {:?} is ready", opt.state_schema);
        }
        Cmd::Start { file, complete } => {
            let migration = load_migration(&file)?;
            let mut migrator =
                Migrator::new(&opt.postgres_url, &opt.schema, opt.lock_timeout, state).await?;
            migrator.start(&migration, &[]).await?;
            info!("migration {:?} started", migration.name);
            if complete {
                migrator.complete().await?;
                info!("migration {:?} completed", migration.name);
            }
            migrator.close().await?;
        }
        Cmd::Complete => {
            let mut migrator =
                Migrator::new(&opt.postgres_url, &opt.schema, opt.lock_timeout, state).await?;
            migrator.complete().await?;
            info!("active migration completed");
            migrator.close().await?;
        }
        Cmd::Rollback => {
            let mut migrator =
                Migrator::new(&opt.postgres_url, &opt.schema, opt.lock_timeout, state).await?;
            migrator.rollback().await?;
            info!("active migration rolled back");
            migrator.close().await?;
        }
        Cmd::Status => {
            let active = match state.get_active_migration(&opt.schema).await {
                Ok(migration) => Some(migration.name),
                Err(err) if err.kind == ErrorKind::NoActiveMigration => None,
                Err(err) => return Err(err.into()),
            };
            let latest = state.latest_version(&opt.schema).await?;
            println!("schema: {}", opt.schema);
            println!("latest: {}", latest.as_deref().unwrap_or("(none)"));
            println!("active: {}", active.as_deref().unwrap_or("(none)"));
        }
    }
    Ok(())
}

fn load_migration(path: &Path) -> Result<Migration> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("could not read migration file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("could not parse migration file {}", path.display()))
}
