//! Node runtime: clocks, periodic sources and the per-node event loop.

pub mod discovery;
pub mod scheduler;

pub use discovery::{DiscoveryNode, NodeEvent, NodeHandle, NodeStats};
pub use scheduler::{node_seed, spawn_timer, Clock, PeriodicSchedule};
