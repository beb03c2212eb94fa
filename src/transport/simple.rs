//! In-process transport with a configurable range graph.
//!
//! Every send is encoded into an [`Envelope`], then delivered from its own
//! tokio task after a random delay. Deliveries may be lost or duplicated
//! according to [`TransportConfig`]; ordering between sends is not kept.

use crate::transport::{Address, Envelope, Fact, Inbox, NodeId, Topology, Transport};
use crate::utils::{NetworkError, Result, TransportConfig};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lossy, duplicating, reordering in-memory transport
#[derive(Clone)]
pub struct SimulatedTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    topology: RwLock<Topology>,
    inboxes: RwLock<HashMap<NodeId, Inbox>>,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Envelopes handed to the transport
    pub sent: u64,
    /// Copies that reached an attached node
    pub delivered: u64,
    /// Copies lost on purpose or addressed to a detached node
    pub dropped: u64,
    /// Extra copies produced by duplication
    pub duplicated: u64,
}

impl SimulatedTransport {
    /// Create a transport over `topology`
    pub fn new(config: TransportConfig, topology: Topology, seed: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topology: RwLock::new(topology),
                inboxes: RwLock::new(HashMap::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                sent: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                duplicated: AtomicU64::new(0),
            }),
        }
    }

    /// Change the range graph while nodes run
    pub fn update_topology<F: FnOnce(&mut Topology)>(&self, update: F) {
        update(&mut self.inner.topology.write());
    }

    /// Get transport statistics
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            duplicated: self.inner.duplicated.load(Ordering::Relaxed),
        }
    }

    /// How many copies of one delivery go out, and after which delays
    fn roll_copies(&self) -> Vec<Duration> {
        let config = &self.inner.config;
        let (min, max) = config.delay_range();
        let mut rng = self.inner.rng.lock();

        if rng.gen_bool(config.loss_probability) {
            return Vec::new();
        }
        let copies = if rng.gen_bool(config.duplicate_probability) {
            2
        } else {
            1
        };
        (0..copies)
            .map(|_| {
                if min == max {
                    min
                } else {
                    rng.gen_range(min..=max)
                }
            })
            .collect()
    }
}

impl Inner {
    fn deliver(&self, target: &NodeId, bytes: &[u8]) {
        let envelope = match Envelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Discarding undecodable envelope for {}: {}", target, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let inbox = self.inboxes.read().get(target).cloned();
        match inbox {
            Some(inbox) if inbox(envelope.into_delivery()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                log::trace!("Dropping delivery to detached node {}", target);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Transport for SimulatedTransport {
    fn attach(&self, node: NodeId, inbox: Inbox) -> Result<()> {
        let mut inboxes = self.inner.inboxes.write();
        if inboxes.contains_key(&node) {
            return Err(NetworkError::AlreadyAttached {
                node: node.to_string(),
            }
            .into());
        }
        log::debug!("Attaching node {} to transport", node);
        inboxes.insert(node, inbox);
        Ok(())
    }

    fn detach(&self, node: &NodeId) {
        if self.inner.inboxes.write().remove(node).is_some() {
            log::debug!("Detached node {} from transport", node);
        }
    }

    fn send(&self, from: &NodeId, fact: Fact, destination: &Address) -> Result<usize> {
        let envelope = Envelope::new(from.clone(), fact);
        let bytes: Arc<[u8]> = envelope.to_bytes()?.into();
        self.inner.sent.fetch_add(1, Ordering::Relaxed);

        let targets = destination.resolve_targets(from, &self.inner.topology.read());
        log::trace!(
            "{} sends {} to {} ({} targets)",
            from,
            envelope.fact,
            destination,
            targets.len()
        );

        let mut scheduled = 0;
        for target in targets.into_iter().filter(|target| target != from) {
            let delays = self.roll_copies();
            if delays.is_empty() {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if delays.len() > 1 {
                self.inner.duplicated.fetch_add(1, Ordering::Relaxed);
            }

            for delay in delays {
                let inner = Arc::clone(&self.inner);
                let bytes = Arc::clone(&bytes);
                let target = target.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    inner.deliver(&target, &bytes);
                });
                scheduled += 1;
            }
        }

        Ok(scheduled)
    }
}
