//! Materialized relation with a declared key and time-to-live.

use crate::transport::{Fact, Value};
use crate::utils::{DiscoveryError, Result, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Retention policy of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Rows older than this without refresh are reaped
    Finite(Duration),
    /// Rows never expire
    Infinite,
}

/// Row limit of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many rows; the stalest row makes room for a new key
    Bounded(usize),
    /// No limit
    Unbounded,
}

/// One stored fact and when it was last derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    /// Stored fact
    pub fact: Fact,
    /// Time of the last insert or refresh, since the node clock's epoch
    pub last_refresh: Duration,
}

/// What an upsert did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New key; `evicted` is the row dropped to respect capacity
    Inserted { evicted: Option<Fact> },
    /// Same key, same values, timestamp refreshed
    Refreshed,
    /// Same key, non-key values replaced
    Updated { previous: Fact },
}

impl UpsertOutcome {
    /// Whether the stored contents changed (not just the timestamp)
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Refreshed)
    }
}

/// Keyed, TTL-bound table of facts of one predicate
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    ttl: Ttl,
    capacity: Capacity,
    keys: Vec<usize>,
    rows: BTreeMap<Vec<Value>, Row>,
}

impl Table {
    /// Create an empty table.
    ///
    /// `keys` are 1-based attribute positions, position 1 being the location.
    /// An empty key list makes the whole fact the key.
    pub fn new<S: Into<String>>(name: S, ttl: Ttl, capacity: Capacity, keys: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            ttl,
            capacity,
            keys,
            rows: BTreeMap::new(),
        }
    }

    /// Relation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retention policy
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Key of `fact` under this table's declared positions
    pub fn key_of(&self, fact: &Fact) -> Result<Vec<Value>> {
        if self.keys.is_empty() {
            return Ok((1..=fact.arity()).filter_map(|pos| fact.attr(pos)).collect());
        }
        self.keys
            .iter()
            .map(|&position| {
                fact.attr(position).ok_or_else(|| {
                    DiscoveryError::from(StoreError::KeyOutOfRange {
                        relation: self.name.clone(),
                        position,
                        arity: fact.arity(),
                    })
                })
            })
            .collect()
    }

    /// Insert `fact`, or overwrite the row with the same key
    pub fn upsert(&mut self, fact: Fact, now: Duration) -> Result<UpsertOutcome> {
        if fact.predicate != self.name {
            return Err(StoreError::WrongRelation {
                relation: self.name.clone(),
                predicate: fact.predicate,
            }
            .into());
        }
        let key = self.key_of(&fact)?;

        if let Some(row) = self.rows.get_mut(&key) {
            row.last_refresh = now;
            if row.fact == fact {
                return Ok(UpsertOutcome::Refreshed);
            }
            let previous = std::mem::replace(&mut row.fact, fact);
            return Ok(UpsertOutcome::Updated { previous });
        }

        let evicted = match self.capacity {
            Capacity::Bounded(max) if self.rows.len() >= max => self.evict_stalest(),
            _ => None,
        };
        self.rows.insert(
            key,
            Row {
                fact,
                last_refresh: now,
            },
        );
        Ok(UpsertOutcome::Inserted { evicted })
    }

    fn evict_stalest(&mut self) -> Option<Fact> {
        let key = self
            .rows
            .iter()
            .min_by_key(|(_, row)| row.last_refresh)
            .map(|(key, _)| key.clone())?;
        let row = self.rows.remove(&key)?;
        log::debug!("{}: evicting {} to respect capacity", self.name, row.fact);
        Some(row.fact)
    }

    /// Remove rows not refreshed within the TTL; returns what was removed
    pub fn reap(&mut self, now: Duration) -> Vec<Row> {
        let Ttl::Finite(ttl) = self.ttl else {
            return Vec::new();
        };

        let expired: Vec<Vec<Value>> = self
            .rows
            .iter()
            .filter(|(_, row)| now.saturating_sub(row.last_refresh) > ttl)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.rows.remove(&key))
            .collect()
    }

    /// Stored facts in key order
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.rows.values().map(|row| &row.fact)
    }

    /// Copy of all rows in key order
    pub fn snapshot(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Address;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn route(src: &str, dst: &str, hops: i64) -> Fact {
        Fact::new(
            "route",
            Address::node(src),
            vec![Value::Addr(Address::node(dst)), Value::Int(hops)],
        )
    }

    fn routes(ttl: Ttl, capacity: Capacity) -> Table {
        Table::new("route", ttl, capacity, vec![1, 2])
    }

    #[test]
    fn test_upsert_replaces_non_key_values() {
        let mut table = routes(Ttl::Infinite, Capacity::Unbounded);

        let outcome = table.upsert(route("A", "B", 3), secs(1)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted { evicted: None });

        let outcome = table.upsert(route("A", "B", 2), secs(2)).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Updated {
                previous: route("A", "B", 3)
            }
        );

        assert_eq!(table.len(), 1);
        let snapshot = table.snapshot();
        assert_eq!(snapshot[0].fact, route("A", "B", 2));
        assert_eq!(snapshot[0].last_refresh, secs(2));
    }

    #[test]
    fn test_reap_uses_strict_age() {
        let mut table = routes(Ttl::Finite(secs(11)), Capacity::Unbounded);
        table.upsert(route("A", "B", 1), secs(6)).unwrap();
        table.upsert(route("A", "C", 1), secs(8)).unwrap();

        assert!(table.reap(secs(17)).is_empty());
        let expired = table.reap(secs(18));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].fact, route("A", "B", 1));
        assert_eq!(expired[0].last_refresh, secs(6));
        assert_eq!(table.len(), 1);
        let expired = table.reap(secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].fact, route("A", "C", 1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_infinite_ttl_never_reaps() {
        let mut table = routes(Ttl::Infinite, Capacity::Unbounded);
        table.upsert(route("A", "B", 1), secs(0)).unwrap();
        assert!(table.reap(secs(u32::MAX as u64)).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_stalest() {
        let mut table = routes(Ttl::Infinite, Capacity::Bounded(2));
        table.upsert(route("A", "B", 1), secs(1)).unwrap();
        table.upsert(route("A", "C", 1), secs(2)).unwrap();
        table.upsert(route("A", "B", 1), secs(3)).unwrap();

        let outcome = table.upsert(route("A", "D", 1), secs(4)).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Inserted {
                evicted: Some(route("A", "C", 1))
            }
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_key_errors() {
        let mut table = Table::new("route", Ttl::Infinite, Capacity::Unbounded, vec![1, 4]);
        assert!(table.upsert(route("A", "B", 1), secs(0)).is_err());

        let other = Fact::new("link", Address::node("A"), vec![]);
        assert!(table.upsert(other, secs(0)).is_err());
    }

    #[test]
    fn test_whole_fact_key() {
        let mut table = Table::new("route", Ttl::Infinite, Capacity::Unbounded, vec![]);
        table.upsert(route("A", "B", 1), secs(0)).unwrap();
        table.upsert(route("A", "B", 2), secs(0)).unwrap();
        assert_eq!(table.len(), 2);
    }
}
