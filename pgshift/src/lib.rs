// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Zero-downtime schema migrations for Postgres.
//!
//! Migrations follow an expand/contract protocol: [Migrator::start] applies
//! the additive half of a migration and materialises a versioned schema of
//! views through which clients address the new shape, while the old shape
//! keeps working; [Migrator::complete] later applies the destructive half
//! and retires the previous version's views. Clients pick a version by
//! pointing their search path at its view schema.

#[macro_use]
extern crate log;

pub mod error;
pub mod migrations;
pub mod migrator;
pub mod schema;
pub mod state;

mod dbconn;
mod sql;
mod views;

pub use error::{Error, ErrorKind, Phase, Result};
pub use migrations::Migration;
pub use migrator::{versioned_schema_name, Migrator};
pub use state::State;
