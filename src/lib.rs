//! # Beacon Discovery
//!
//! One-hop neighbor discovery driven by a small declarative rule program.
//! Every node periodically broadcasts a beacon, learns which nodes are in
//! range from the beacons it hears, and keeps a TTL-bound table of live
//! links.
//!
//! ## Features
//!
//! - **Rule Programs**: `materialize`, `periodic` and labelled rules in a
//!   compact Datalog-like language, checked before any node starts
//! - **Event-Driven Evaluation**: each timer firing or delivery runs one
//!   cascade to a local fixpoint
//! - **TTL Tables**: keyed relations with refresh-on-rederive and expiry
//! - **Simulated Transport**: lossy, duplicating, unordered delivery over a
//!   configurable range graph
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use beacon_discovery::{App, DiscoveryConfig, NodeId, Topology};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (a, b) = (NodeId::new("A"), NodeId::new("B"));
//!     let mut topology = Topology::new();
//!     topology.connect(&a, &b);
//!
//!     let mut app = App::new(DiscoveryConfig::default(), topology)?;
//!     app.start_node(a.clone())?;
//!     app.start_node(b)?;
//!     app.run_until(12, &[]).await?;
//!     for link in app.links(&a).await? {
//!         println!("{link}");
//!     }
//!     app.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`]: parser, compiler and evaluator of rule programs
//! - [`store`]: materialized relations and the typed link table
//! - [`transport`]: facts, wire envelopes and the simulated transport
//! - [`network`]: clocks, periodic sources and the per-node event loop
//! - [`app`]: simulation lifecycle
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod engine;
pub mod network;
pub mod store;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{build_topology, App, ScheduledStop, SimulationReport};
pub use engine::{load_program, Program, DEFAULT_PROGRAM};
pub use network::{DiscoveryNode, NodeHandle, NodeStats};
pub use store::{LinkEntry, LinkStore};
pub use transport::{Address, Fact, NodeId, SimulatedTransport, Topology, Transport, Value};
pub use utils::{DiscoveryConfig, DiscoveryError, Result};

/// Default protocol constants, in time units
pub mod defaults {
    /// Time between two beacons of one node
    pub const BEACON_PERIOD: u64 = 5;

    /// Delay before a node's first beacon
    pub const INITIAL_DELAY: u64 = 1;

    /// Exclusive upper bound of the per-beacon jitter
    pub const SPACEOUT: u64 = 4;

    /// Link lifetime without refresh
    pub const TIMEOUT: u64 = 11;
}
