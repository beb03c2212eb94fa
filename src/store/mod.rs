//! Materialized relations held by one node.

pub mod link;
pub mod table;

pub use link::{link_entries, link_fact, LinkEntry, LinkStore, LINK_RELATION};
pub use table::{Capacity, Row, Table, Ttl, UpsertOutcome};

use crate::transport::Fact;
use std::collections::BTreeMap;
use std::time::Duration;

/// All tables of one node, by relation name
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, Table>,
}

impl Catalog {
    /// Catalog holding `tables`
    pub fn new(tables: impl IntoIterator<Item = Table>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|table| (table.name().to_string(), table))
                .collect(),
        }
    }

    /// Table of a relation
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Mutable table of a relation
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Stored facts of `predicate`, empty if it is not materialized
    pub fn facts<'a>(&'a self, predicate: &str) -> Box<dyn Iterator<Item = &'a Fact> + 'a> {
        match self.tables.get(predicate) {
            Some(table) => Box::new(table.facts()),
            None => Box::new(std::iter::empty()),
        }
    }

    /// Reap every table; returns the expired rows
    pub fn reap(&mut self, now: Duration) -> Vec<Row> {
        self.tables
            .values_mut()
            .flat_map(|table| table.reap(now))
            .collect()
    }
}
