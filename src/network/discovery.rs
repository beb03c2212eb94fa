//! Discovery node runtime.
//!
//! Each node owns its tables and processes one event at a time from a single
//! queue: timer firings, deliveries from the transport, reaper ticks and
//! inspection requests. Expired rows are reaped before every event, so no
//! event ever observes a row older than its relation's TTL.

use crate::engine::{to_duration, Evaluator, Program};
use crate::network::scheduler::{node_seed, spawn_timer, Clock, PeriodicSchedule};
use crate::store::{Catalog, LinkEntry, LinkStore, Row, Table, UpsertOutcome};
use crate::transport::{Delivery, Fact, Inbox, NodeId, Transport};
use crate::utils::{DiscoveryError, NetworkError, Result, RuntimeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Work item of a node's queue
#[derive(Debug)]
pub enum NodeEvent {
    /// Periodic source `timer` fired for the `seq`-th time
    Tick {
        /// Index into the program's timers
        timer: usize,
        /// Firing number, from 0
        seq: u64,
    },
    /// Fact arrived from the transport
    Deliver(Delivery),
    /// Reaper tick
    Reap,
    /// Copy of a relation's rows; `None` if it is not materialized
    Snapshot {
        /// Relation name
        relation: String,
        /// Reply channel
        reply: oneshot::Sender<Option<Vec<Row>>>,
    },
    /// Current link table; empty if the program does not materialize `link`
    Links(oneshot::Sender<Vec<LinkEntry>>),
    /// Copy of the node's counters
    Stats(oneshot::Sender<NodeStats>),
    /// Leave the event loop
    Stop,
}

/// Per-node counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Periodic firings processed
    pub ticks: u64,
    /// Deliveries processed
    pub received: u64,
    /// Deliveries dropped because the transport reported this node as sender
    pub ignored: u64,
    /// Facts handed to the transport
    pub sent: u64,
    /// Sends the transport refused
    pub send_failures: u64,
    /// New rows
    pub inserted: u64,
    /// Rows whose non-key values changed
    pub updated: u64,
    /// Rows re-derived unchanged
    pub refreshed: u64,
    /// Rows reaped after their TTL
    pub expired: u64,
    /// Rows dropped to respect a relation's size
    pub evicted: u64,
    /// Cascades stopped at the step limit
    pub truncated: u64,
    /// Bindings dropped by evaluation errors
    pub failed_bindings: u64,
    /// Heads derived per rule
    pub firings: BTreeMap<String, u64>,
}

/// State of one node, driven by [`DiscoveryNode::process`]
pub struct DiscoveryNode {
    id: NodeId,
    program: Arc<Program>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    catalog: Catalog,
    time_unit: Duration,
    reap_interval: Duration,
    max_steps: usize,
    stats: NodeStats,
}

impl DiscoveryNode {
    /// Node `id` running `program`, with empty tables
    pub fn new(
        id: NodeId,
        program: Arc<Program>,
        transport: Arc<dyn Transport>,
        clock: Clock,
        runtime: &RuntimeConfig,
    ) -> Self {
        let time_unit = runtime.time_unit();
        let catalog = Catalog::new(program.tables().iter().map(|decl| decl.table(time_unit)));
        Self {
            id,
            program,
            transport,
            clock,
            catalog,
            time_unit,
            reap_interval: to_duration(time_unit, runtime.reap_interval),
            max_steps: runtime.max_cascade_steps,
            stats: NodeStats::default(),
        }
    }

    /// Node id
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Materialized relations
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Counters so far
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Handle one event at time `now`; returns false on [`NodeEvent::Stop`]
    pub fn process(&mut self, event: NodeEvent, now: Duration) -> bool {
        self.reap(now);

        match event {
            NodeEvent::Tick { timer, seq } => {
                let Some(spec) = self.program.timers().get(timer) else {
                    log::warn!("{}: tick for unknown timer {}", self.id, timer);
                    return true;
                };
                self.stats.ticks += 1;
                let trigger = spec.trigger_fact(&self.id, seq);
                self.derive(trigger, now);
            }
            NodeEvent::Deliver(delivery) => self.deliver(delivery, now),
            NodeEvent::Reap => {}
            NodeEvent::Snapshot { relation, reply } => {
                let rows = self.catalog.table(&relation).map(Table::snapshot);
                let _ = reply.send(rows);
            }
            NodeEvent::Links(reply) => {
                let links = LinkStore::open(&mut self.catalog)
                    .map(|links| links.snapshot())
                    .unwrap_or_default();
                let _ = reply.send(links);
            }
            NodeEvent::Stats(reply) => {
                let _ = reply.send(self.stats.clone());
            }
            NodeEvent::Stop => return false,
        }
        true
    }

    fn reap(&mut self, now: Duration) {
        let lost = LinkStore::open(&mut self.catalog)
            .map(|mut links| links.reap(now))
            .unwrap_or_default();
        for entry in lost {
            log::info!(
                "{} t={:.3}: lost link to {}, last heard at {:.3}",
                self.id,
                self.units(now),
                entry.neighbor,
                self.units(entry.last_refresh)
            );
            self.stats.expired += 1;
        }

        for row in self.catalog.reap(now) {
            log::info!("{} t={:.3}: expired {}", self.id, self.units(now), row.fact);
            self.stats.expired += 1;
        }
    }

    fn deliver(&mut self, delivery: Delivery, now: Duration) {
        if delivery.sender == self.id {
            log::warn!(
                "{}: dropping {} delivered from itself ({})",
                self.id,
                delivery.fact,
                delivery.message_id
            );
            self.stats.ignored += 1;
            return;
        }

        self.stats.received += 1;
        log::trace!(
            "{}: received {} from {} ({})",
            self.id,
            delivery.fact,
            delivery.sender,
            delivery.message_id
        );
        if let Some(addressee) = delivery.fact.location.as_node() {
            if *addressee != self.id {
                log::debug!(
                    "{}: {} from {} was addressed to {}, localizing anyway",
                    self.id,
                    delivery.fact,
                    delivery.sender,
                    addressee
                );
            }
        }
        self.derive(delivery.fact.localized(&self.id), now);
    }

    fn units(&self, now: Duration) -> f64 {
        now.as_secs_f64() / self.time_unit.as_secs_f64()
    }

    fn derive(&mut self, trigger: Fact, now: Duration) {
        let derivation = Evaluator::new(&self.program, &self.id, self.max_steps)
            .evaluate(trigger, &mut self.catalog, now);
        log::debug!(
            "{}: cascade of {} steps, {} outbound, {} stored, {} transient",
            self.id,
            derivation.steps,
            derivation.outbound.len(),
            derivation.stored.len(),
            derivation.transient
        );

        for (fact, outcome) in &derivation.stored {
            match outcome {
                UpsertOutcome::Inserted { evicted } => {
                    log::info!("{} t={:.3}: learned {}", self.id, self.units(now), fact);
                    self.stats.inserted += 1;
                    if let Some(evicted) = evicted {
                        log::debug!("{}: evicted {}", self.id, evicted);
                        self.stats.evicted += 1;
                    }
                }
                UpsertOutcome::Updated { previous } => {
                    log::debug!("{}: {} replaced {}", self.id, fact, previous);
                    self.stats.updated += 1;
                }
                UpsertOutcome::Refreshed => self.stats.refreshed += 1,
            }
        }
        for (rule, count) in derivation.firings {
            *self.stats.firings.entry(rule).or_default() += count;
        }
        if derivation.truncated {
            self.stats.truncated += 1;
        }
        self.stats.failed_bindings += derivation.failures as u64;

        for (destination, fact) in derivation.outbound {
            match self.transport.send(&self.id, fact, &destination) {
                Ok(_) => self.stats.sent += 1,
                Err(e) => {
                    log::warn!("{}: send to {} failed: {}", self.id, destination, e);
                    self.stats.send_failures += 1;
                }
            }
        }
    }

    /// Attach to the transport and run the node on the tokio runtime.
    ///
    /// `seed` is the run seed; the node derives its own jitter generator from
    /// it and its id.
    pub fn spawn(self, seed: u64) -> Result<NodeHandle> {
        let (events, mut queue) = mpsc::unbounded_channel();

        let inbox_events = events.clone();
        let inbox: Inbox =
            Arc::new(move |delivery| inbox_events.send(NodeEvent::Deliver(delivery)).is_ok());
        self.transport.attach(self.id.clone(), inbox)?;

        let start = self.clock.now();
        let mut rng = StdRng::seed_from_u64(node_seed(seed, self.id.as_str()));
        let mut timers = Vec::new();
        for (timer, spec) in self.program.timers().iter().enumerate() {
            let timer_rng = StdRng::seed_from_u64(rng.gen());
            let schedule = PeriodicSchedule::new(spec, self.time_unit, start, timer_rng);
            let events = events.clone();
            timers.push(spawn_timer(schedule, self.clock, move |seq| {
                events.send(NodeEvent::Tick { timer, seq }).is_ok()
            }));
        }

        if let Some(reaper) = spawn_reaper(events.clone(), self.reap_interval) {
            timers.push(reaper);
        } else if !self.reap_interval.is_zero() {
            log::warn!(
                "{}: reap interval {:?} is out of range, rows expire only on events",
                self.id,
                self.reap_interval
            );
        }

        log::info!(
            "Node {} started with {} periodic sources",
            self.id,
            self.program.timers().len()
        );

        let id = self.id.clone();
        let transport = Arc::clone(&self.transport);
        let mut node = self;
        let task = tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                let now = node.clock.now();
                if !node.process(event, now) {
                    break;
                }
            }
            log::info!("Node {} stopped", node.id);
            node.stats
        });

        Ok(NodeHandle {
            id,
            events,
            timers,
            task,
            transport,
        })
    }
}

/// Enqueue a `Reap` every `period`; `None` when the period is zero or too
/// large to schedule
fn spawn_reaper(
    events: mpsc::UnboundedSender<NodeEvent>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    let now = Instant::now();
    let first = now.checked_add(period)?;
    first.checked_add(period)?;

    Some(tokio::spawn(async move {
        let mut reaper = interval_at(first, period);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            reaper.tick().await;
            if events.send(NodeEvent::Reap).is_err() {
                break;
            }
        }
    }))
}

/// Control handle of a running node
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::UnboundedSender<NodeEvent>,
    timers: Vec<JoinHandle<()>>,
    task: JoinHandle<NodeStats>,
    transport: Arc<dyn Transport>,
}

impl NodeHandle {
    /// Id of the node
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    fn request(&self, event: NodeEvent) -> Result<()> {
        self.events.send(event).map_err(|_| {
            NetworkError::NodeStopped {
                node: self.id.to_string(),
            }
            .into()
        })
    }

    async fn reply<T>(&self, receiver: oneshot::Receiver<T>) -> Result<T> {
        receiver.await.map_err(|_| {
            NetworkError::NodeStopped {
                node: self.id.to_string(),
            }
            .into()
        })
    }

    /// Rows of `relation`; empty if the relation is not materialized
    pub async fn snapshot(&self, relation: &str) -> Result<Vec<Row>> {
        let (reply, receiver) = oneshot::channel();
        self.request(NodeEvent::Snapshot {
            relation: relation.to_string(),
            reply,
        })?;
        Ok(self.reply(receiver).await?.unwrap_or_default())
    }

    /// Current link table
    pub async fn links(&self) -> Result<Vec<LinkEntry>> {
        let (reply, receiver) = oneshot::channel();
        self.request(NodeEvent::Links(reply))?;
        self.reply(receiver).await
    }

    /// Current counters
    pub async fn stats(&self) -> Result<NodeStats> {
        let (reply, receiver) = oneshot::channel();
        self.request(NodeEvent::Stats(reply))?;
        self.reply(receiver).await
    }

    /// Stop timers, detach from the transport and wait for the event loop.
    ///
    /// Returns the node's final counters.
    pub async fn stop(self) -> Result<NodeStats> {
        for timer in &self.timers {
            timer.abort();
        }
        self.transport.detach(&self.id);
        // The loop may already be gone; the join below reports it either way
        let _ = self.events.send(NodeEvent::Stop);
        self.task
            .await
            .map_err(|e| DiscoveryError::unexpected(format!("node {} task failed: {e}", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{load_program, DEFAULT_PROGRAM};
    use crate::store::{link_fact, LINK_RELATION};
    use crate::transport::{Address, Value};
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, Address, Fact)>>,
        attached: Mutex<Vec<NodeId>>,
    }

    impl Transport for RecordingTransport {
        fn attach(&self, node: NodeId, _inbox: Inbox) -> Result<()> {
            self.attached.lock().push(node);
            Ok(())
        }

        fn detach(&self, node: &NodeId) {
            self.attached.lock().retain(|n| n != node);
        }

        fn send(&self, from: &NodeId, fact: Fact, destination: &Address) -> Result<usize> {
            self.sent.lock().push((from.clone(), destination.clone(), fact));
            Ok(1)
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn node(id: &str, transport: Arc<RecordingTransport>) -> DiscoveryNode {
        node_running(id, DEFAULT_PROGRAM, transport)
    }

    fn node_running(id: &str, source: &str, transport: Arc<RecordingTransport>) -> DiscoveryNode {
        let program = Arc::new(load_program(source, &BTreeMap::new()).unwrap());
        DiscoveryNode::new(
            NodeId::new(id),
            program,
            transport,
            Clock::start(),
            &RuntimeConfig::default(),
        )
    }

    fn beacon_from(sender: &str) -> NodeEvent {
        NodeEvent::Deliver(Delivery {
            message_id: Uuid::new_v4(),
            sender: NodeId::new(sender),
            fact: Fact::new("beacon", Address::Broadcast, vec![Value::Addr(Address::node(sender))]),
        })
    }

    fn link_count(node: &DiscoveryNode) -> usize {
        node.catalog().table(LINK_RELATION).map_or(0, Table::len)
    }

    #[tokio::test]
    async fn test_tick_sends_beacon() {
        let transport = Arc::new(RecordingTransport::default());
        let mut b = node("B", Arc::clone(&transport));

        assert!(b.process(NodeEvent::Tick { timer: 0, seq: 0 }, secs(1)));

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let (from, destination, fact) = &sent[0];
        assert_eq!(from, &NodeId::new("B"));
        assert_eq!(destination, &Address::Broadcast);
        assert_eq!(fact.predicate, "beacon");
        assert_eq!(b.stats().sent, 1);
        assert_eq!(b.stats().firings.get("r1"), Some(&1));
    }

    #[tokio::test]
    async fn test_delivery_learns_link() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node("A", Arc::clone(&transport));

        a.process(beacon_from("B"), secs(5));
        a.process(beacon_from("B"), secs(6));

        let rows = a.catalog().table(LINK_RELATION).unwrap().snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fact, link_fact(&NodeId::new("A"), &NodeId::new("B"), 1));
        assert_eq!(rows[0].last_refresh, secs(6));
        assert_eq!(a.stats().inserted, 1);
        assert_eq!(a.stats().refreshed, 1);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reap_before_every_event() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node("A", transport);

        a.process(beacon_from("B"), secs(6));
        a.process(NodeEvent::Reap, secs(17));
        assert_eq!(link_count(&a), 1);

        let (reply, mut receiver) = oneshot::channel();
        a.process(
            NodeEvent::Snapshot {
                relation: LINK_RELATION.to_string(),
                reply,
            },
            secs(18),
        );
        assert_eq!(receiver.try_recv().unwrap(), Some(Vec::new()));
        assert_eq!(a.stats().expired, 1);
        assert!(!a.process(NodeEvent::Stop, secs(19)));
    }

    #[tokio::test]
    async fn test_delivered_rows_are_stored() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node_running(
            "A",
            "materialize(link, infinity, infinity, keys(1,2)).
             materialize(seen, infinity, infinity, keys(1,2)).
             mark seen(@X, Y) :- link(@X, Y, _).",
            transport,
        );
        let shipped = link_fact(&NodeId::new("A"), &NodeId::new("B"), 1);
        let deliver = || {
            NodeEvent::Deliver(Delivery {
                message_id: Uuid::new_v4(),
                sender: NodeId::new("B"),
                fact: shipped.clone(),
            })
        };

        a.process(deliver(), secs(1));
        assert_eq!(link_count(&a), 1);
        assert_eq!(a.catalog().table("seen").map_or(0, Table::len), 1);
        assert_eq!(a.stats().inserted, 2);

        a.process(deliver(), secs(2));
        assert_eq!(link_count(&a), 1);
        assert_eq!(a.stats().refreshed, 1);
        assert_eq!(a.stats().firings.get("mark"), Some(&1));
    }

    #[tokio::test]
    async fn test_delivery_from_self_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node("A", transport);

        a.process(beacon_from("A"), secs(5));
        assert_eq!(link_count(&a), 0);
        assert_eq!(a.stats().ignored, 1);
        assert_eq!(a.stats().received, 0);

        a.process(beacon_from("B"), secs(6));
        assert_eq!(a.stats().received, 1);
    }

    #[tokio::test]
    async fn test_links_request_reaps_first() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node("A", transport);
        a.process(beacon_from("B"), secs(2));
        a.process(beacon_from("C"), secs(6));

        let (reply, mut receiver) = oneshot::channel();
        a.process(NodeEvent::Links(reply), secs(14));
        let links = receiver.try_recv().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].neighbor, NodeId::new("C"));
        assert_eq!(links[0].last_refresh, secs(6));
        assert_eq!(a.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_unknown_timer_is_ignored() {
        let transport = Arc::new(RecordingTransport::default());
        let mut a = node("A", Arc::clone(&transport));
        assert!(a.process(NodeEvent::Tick { timer: 9, seq: 0 }, secs(1)));
        assert_eq!(a.stats().ticks, 0);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_node_beacons_until_stopped() {
        let transport = Arc::new(RecordingTransport::default());
        let handle = node("B", Arc::clone(&transport)).spawn(42).unwrap();
        assert_eq!(transport.attached.lock().as_slice(), [NodeId::new("B")]);

        // First beacon in [1, 5), second in [6, 10)
        tokio::time::sleep(secs(10)).await;
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.ticks, 2);
        assert!(handle.links().await.unwrap().is_empty());
        assert!(handle.snapshot("nothing").await.unwrap().is_empty());

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.sent, 2);
        assert!(transport.attached.lock().is_empty());

        tokio::time::sleep(secs(20)).await;
        assert_eq!(transport.sent.lock().len(), 2);
    }
}
