//! Simulation lifecycle and coordination.
//!
//! [`App`] owns the simulated transport, the loaded rule program and the
//! handles of all running nodes. It starts and stops nodes, advances the
//! simulation and collects link tables for reporting.

use crate::{
    engine::{load_program, to_duration, Program, DEFAULT_PROGRAM},
    network::{Clock, DiscoveryNode, NodeHandle, NodeStats},
    store::LinkEntry,
    transport::{NodeId, SimulatedTransport, Topology, Transport, TransportStats},
    utils::{ConfigError, DiscoveryConfig, DiscoveryError, NetworkError, ProtocolConfig, Result},
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// A node to stop at a given time, written `B@6`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledStop {
    /// Node to stop
    pub node: NodeId,
    /// Time in time units since the simulation started
    pub at: u64,
}

impl FromStr for ScheduledStop {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ConfigError::InvalidValue {
            field: "stop".to_string(),
            value: s.to_string(),
        };
        let (node, at) = s.split_once('@').ok_or_else(invalid)?;
        let at = at.trim().parse().map_err(|_| invalid())?;
        if node.trim().is_empty() {
            return Err(invalid().into());
        }
        Ok(Self {
            node: NodeId::new(node.trim()),
            at,
        })
    }
}

/// Range graph over `nodes`, with one symmetric edge per `A-B` link.
///
/// Node ids may contain `-`; the link is split at the one `-` whose two sides
/// are both known nodes.
pub fn build_topology(nodes: &[NodeId], links: &[String]) -> Result<Topology> {
    let mut topology = Topology::new();
    for link in links {
        let (a, b) = split_link(nodes, link)?;
        topology.connect(&a, &b);
    }
    Ok(topology)
}

fn split_link(nodes: &[NodeId], link: &str) -> Result<(NodeId, NodeId)> {
    let invalid = || ConfigError::InvalidValue {
        field: "link".to_string(),
        value: link.to_string(),
    };
    let ends = |at: usize| {
        (
            NodeId::new(link[..at].trim()),
            NodeId::new(link[at + 1..].trim()),
        )
    };

    let splits: Vec<usize> = link.match_indices('-').map(|(at, _)| at).collect();
    let known: Vec<(NodeId, NodeId)> = splits
        .iter()
        .map(|&at| ends(at))
        .filter(|(a, b)| nodes.contains(a) && nodes.contains(b))
        .collect();

    match known.as_slice() {
        [edge] => Ok(edge.clone()),
        [] => {
            let &first = splits.first().ok_or_else(invalid)?;
            let (a, b) = ends(first);
            let unknown = if nodes.contains(&a) { b } else { a };
            Err(NetworkError::UnknownNode {
                node: unknown.to_string(),
            }
            .into())
        }
        _ => Err(invalid().into()),
    }
}

/// Link table and counters of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Node id
    pub node: NodeId,
    /// Whether the node was still running
    pub running: bool,
    /// Link table; empty once the node is stopped
    pub links: Vec<LinkEntry>,
    /// Counters at report time, or at stop time
    pub stats: NodeStats,
}

/// State of the whole simulation
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Report time in time units
    pub at: f64,
    /// Per-node state, ordered by id
    pub nodes: Vec<NodeReport>,
    /// Transport counters
    pub transport: TransportStats,
}

/// Main application structure
pub struct App {
    /// Application configuration
    config: DiscoveryConfig,
    /// Compiled rule program shared by all nodes
    program: Arc<Program>,
    /// In-process transport
    transport: SimulatedTransport,
    /// Simulation time base
    clock: Clock,
    /// Running nodes
    nodes: BTreeMap<NodeId, NodeHandle>,
    /// Final counters of stopped nodes
    stopped: BTreeMap<NodeId, NodeStats>,
}

impl App {
    /// Create a simulation over `topology`; no node runs yet
    pub fn new(config: DiscoveryConfig, topology: Topology) -> Result<Self> {
        config.validate()?;
        let program = Self::load_program(&config.protocol)?;
        let transport =
            SimulatedTransport::new(config.transport.clone(), topology, config.runtime.seed);

        Ok(Self {
            config,
            program: Arc::new(program),
            transport,
            clock: Clock::start(),
            nodes: BTreeMap::new(),
            stopped: BTreeMap::new(),
        })
    }

    /// Load the configured program file, or the built-in one
    pub fn load_program(protocol: &ProtocolConfig) -> Result<Program> {
        let constants = protocol.constants();
        match &protocol.program {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })?;
                log::info!("Loading rule program from {}", path.display());
                load_program(&source, &constants)
            }
            None => load_program(DEFAULT_PROGRAM, &constants),
        }
    }

    /// The compiled program
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The transport, for topology changes and counters
    pub fn transport(&self) -> &SimulatedTransport {
        &self.transport
    }

    /// Time since the simulation started
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Time since the simulation started, in time units
    pub fn now_units(&self) -> f64 {
        self.now().as_secs_f64() / self.config.runtime.time_unit().as_secs_f64()
    }

    /// Ids of running nodes
    pub fn running(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Start node `id` with empty tables
    pub fn start_node(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(NetworkError::AlreadyAttached {
                node: id.to_string(),
            }
            .into());
        }
        let transport: Arc<dyn Transport> = Arc::new(self.transport.clone());
        let node = DiscoveryNode::new(
            id.clone(),
            Arc::clone(&self.program),
            transport,
            self.clock,
            &self.config.runtime,
        );
        let handle = node.spawn(self.config.runtime.seed)?;
        self.stopped.remove(&id);
        self.nodes.insert(id, handle);
        Ok(())
    }

    /// Stop node `id`; returns its final counters
    pub async fn stop_node(&mut self, id: &NodeId) -> Result<NodeStats> {
        let handle = self.nodes.remove(id).ok_or_else(|| NetworkError::UnknownNode {
            node: id.to_string(),
        })?;
        let stats = handle.stop().await?;
        log::info!("Stopped node {} at {:.3}", id, self.now_units());
        self.stopped.insert(id.clone(), stats.clone());
        Ok(stats)
    }

    fn handle(&self, id: &NodeId) -> Result<&NodeHandle> {
        self.nodes.get(id).ok_or_else(|| {
            NetworkError::UnknownNode {
                node: id.to_string(),
            }
            .into()
        })
    }

    /// Current link table of a running node
    pub async fn links(&self, id: &NodeId) -> Result<Vec<LinkEntry>> {
        self.handle(id)?.links().await
    }

    /// Current counters of a running node
    pub async fn stats(&self, id: &NodeId) -> Result<NodeStats> {
        self.handle(id)?.stats().await
    }

    /// Advance until `units` time units after start, applying `stops` on the way
    pub async fn run_until(&mut self, units: u64, stops: &[ScheduledStop]) -> Result<()> {
        let unit = self.config.runtime.time_unit();
        let end = self
            .clock
            .instant_at(to_duration(unit, units))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "duration".to_string(),
                value: units.to_string(),
            })?;
        let mut stops: Vec<&ScheduledStop> = stops.iter().collect();
        stops.sort_by_key(|stop| stop.at);

        for stop in stops {
            if stop.at > units {
                log::warn!(
                    "Ignoring stop of {} at {}: after the end of the run",
                    stop.node,
                    stop.at
                );
                continue;
            }
            // Stops lie before the end, so their instants are in range
            if let Some(at) = self.clock.instant_at(to_duration(unit, stop.at)) {
                tokio::time::sleep_until(at).await;
            }
            match self.stop_node(&stop.node).await {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => log::warn!("Cannot stop {}: {}", stop.node, e),
                Err(e) => return Err(e),
            }
        }

        tokio::time::sleep_until(end).await;
        Ok(())
    }

    /// Link tables and counters of every node started so far
    pub async fn report(&self) -> Result<SimulationReport> {
        let at = self.now_units();
        let mut nodes = Vec::new();
        for (id, handle) in &self.nodes {
            nodes.push(NodeReport {
                node: id.clone(),
                running: true,
                links: handle.links().await?,
                stats: handle.stats().await?,
            });
        }
        for (id, stats) in &self.stopped {
            nodes.push(NodeReport {
                node: id.clone(),
                running: false,
                links: Vec::new(),
                stats: stats.clone(),
            });
        }
        nodes.sort_by(|a, b| a.node.cmp(&b.node));

        Ok(SimulationReport {
            at,
            nodes,
            transport: self.transport.stats(),
        })
    }

    /// Stop every running node
    pub async fn shutdown(mut self) -> Result<BTreeMap<NodeId, NodeStats>> {
        log::info!("Shutting down {} nodes", self.nodes.len());
        let handles = std::mem::take(&mut self.nodes);
        let results = join_all(
            handles
                .into_iter()
                .map(|(id, handle)| async move { (id, handle.stop().await) }),
        )
        .await;

        let mut stats = self.stopped;
        for (id, result) in results {
            stats.insert(id, result?);
        }
        Ok(stats)
    }
}
