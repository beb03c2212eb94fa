//! Typed view of the `link` relation.

use crate::store::{Catalog, Row, Table};
use crate::transport::{Address, Fact, NodeId, Value};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Name of the neighbor relation
pub const LINK_RELATION: &str = "link";

/// One discovered one-hop link, as stored at `source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkEntry {
    /// Node holding the row
    pub source: NodeId,
    /// Node it heard
    pub neighbor: NodeId,
    /// Link cost
    pub cost: i64,
    /// Time of the last refresh
    pub last_refresh: Duration,
}

/// Build a `link(@source, neighbor, cost)` fact
pub fn link_fact(source: &NodeId, neighbor: &NodeId, cost: i64) -> Fact {
    Fact::new(
        LINK_RELATION,
        Address::Node(source.clone()),
        vec![Value::Addr(Address::Node(neighbor.clone())), Value::Int(cost)],
    )
}

impl TryFrom<&Row> for LinkEntry {
    type Error = String;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let fact = &row.fact;
        let malformed = || format!("not a link row: {fact}");

        if fact.predicate != LINK_RELATION {
            return Err(malformed());
        }
        let source = fact.location.as_node().ok_or_else(malformed)?;
        let (neighbor, cost) = match fact.attrs.as_slice() {
            [Value::Addr(Address::Node(neighbor)), Value::Int(cost)] => (neighbor, *cost),
            _ => return Err(malformed()),
        };

        Ok(Self {
            source: source.clone(),
            neighbor: neighbor.clone(),
            cost,
            last_refresh: row.last_refresh,
        })
    }
}

impl fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}) refreshed at {:.3}",
            self.source,
            self.neighbor,
            self.cost,
            self.last_refresh.as_secs_f64()
        )
    }
}

/// Link entries of a snapshot; rows of another shape are skipped with a warning
pub fn link_entries(rows: &[Row]) -> Vec<LinkEntry> {
    rows.iter()
        .filter_map(|row| match LinkEntry::try_from(row) {
            Ok(entry) => Some(entry),
            Err(reason) => {
                log::warn!("{}", reason);
                None
            }
        })
        .collect()
}

/// Typed view of a node's `link` table
#[derive(Debug)]
pub struct LinkStore<'a> {
    table: &'a mut Table,
}

impl<'a> LinkStore<'a> {
    /// View of the `link` table in `catalog`; `None` if the program does not
    /// materialize it
    pub fn open(catalog: &'a mut Catalog) -> Option<Self> {
        catalog
            .table_mut(LINK_RELATION)
            .map(|table| Self { table })
    }

    /// Drop rows older than the TTL; returns the entries removed
    pub fn reap(&mut self, now: Duration) -> Vec<LinkEntry> {
        link_entries(&self.table.reap(now))
    }

    /// All rows, ordered by (source, neighbor)
    pub fn snapshot(&self) -> Vec<LinkEntry> {
        link_entries(&self.table.snapshot())
    }
}
