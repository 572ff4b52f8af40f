// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use std::collections::HashMap;

/// In-memory description of a logical schema.
///
/// A fresh model read from the database maps every column under its physical
/// name. While a migration is in flight, operations may re-key columns so
/// that the name clients address (the map key) diverges from the physical
/// column underneath.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub name: String,
    pub tables: HashMap<String, Table>,
}

/// An SQL table, with columns keyed by their logical name.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: HashMap<String, Column>,
}

/// An SQL column. `name` is the physical column; the logical name under
/// which clients see it is the key in [Table::columns].
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl Schema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            tables: HashMap::new(),
        }
    }

    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn get_table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn remove_table(&mut self, name: &str) {
        self.tables.remove(name);
    }
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            columns: HashMap::new(),
        }
    }

    pub fn get_column(&self, logical: &str) -> Option<&Column> {
        self.columns.get(logical)
    }

    pub fn add_column(&mut self, logical: &str, column: Column) {
        self.columns.insert(logical.to_owned(), column);
    }

    pub fn remove_column(&mut self, logical: &str) -> Option<Column> {
        self.columns.remove(logical)
    }

    /// Re-key a column under a new logical name. The physical column is
    /// untouched. Returns false if `from` does not exist.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.columns.remove(from) {
            Some(column) => {
                self.columns.insert(to.to_owned(), column);
                true
            }
            None => false,
        }
    }
}
