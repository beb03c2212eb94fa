//! Transport layer for fact delivery between nodes.
//!
//! This module defines the wire format, the range graph and the in-process
//! transport used by simulations.

pub mod protocol;
pub mod simple;
pub mod topology;

pub use protocol::*;
pub use simple::{SimulatedTransport, TransportStats};
pub use topology::Topology;

use crate::utils::Result;
use std::sync::Arc;

/// Callback that hands a delivery to a node; returns false once the node is gone
pub type Inbox = Arc<dyn Fn(Delivery) -> bool + Send + Sync>;

/// Best-effort, unordered fact delivery
pub trait Transport: Send + Sync {
    /// Start delivering facts addressed to `node` into `inbox`
    fn attach(&self, node: NodeId, inbox: Inbox) -> Result<()>;

    /// Stop delivering to `node`; in-flight copies are dropped
    fn detach(&self, node: &NodeId);

    /// Send `fact` from `from` to a node or to everyone in range.
    ///
    /// Returns how many copies were scheduled. Zero is not an error.
    fn send(&self, from: &NodeId, fact: Fact, destination: &Address) -> Result<usize>;
}
