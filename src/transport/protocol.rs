//! Fact representation and the node-to-node wire format.
//!
//! A [`Fact`] travels inside an [`Envelope`] stamped with the transport-level
//! sender. On arrival the envelope becomes a [`Delivery`], which keeps the
//! sender next to the payload instead of folding it into the fact.

use crate::transport::Topology;
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded envelope size (64KB)
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Identifier of a concrete node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identifier
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Location specifier of a fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    /// A concrete node
    Node(NodeId),
    /// Every node currently in range of the sender
    Broadcast,
}

impl Address {
    /// Address of a concrete node
    pub fn node<S: Into<String>>(id: S) -> Self {
        Self::Node(NodeId::new(id))
    }

    /// Concrete node, if this is not the broadcast address
    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            Self::Node(id) => Some(id),
            Self::Broadcast => None,
        }
    }

    /// Whether a fact with this location stays on `local`
    pub fn is_local_to(&self, local: &NodeId) -> bool {
        self.as_node() == Some(local)
    }

    /// Nodes a fact sent from `from` to this address must reach
    pub fn resolve_targets(&self, from: &NodeId, topology: &Topology) -> Vec<NodeId> {
        match self {
            Self::Node(id) => vec![id.clone()],
            Self::Broadcast => topology
                .neighbors(from)
                .into_iter()
                .filter(|id| id != from)
                .collect(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Broadcast => f.write_str("*"),
        }
    }
}

/// Attribute value of a fact
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Node address
    Addr(Address),
    /// Signed integer
    Int(i64),
    /// Text
    Str(String),
}

impl Value {
    /// Name of the value's type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Addr(_) => "address",
            Self::Int(_) => "integer",
            Self::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A located tuple: predicate, location (attribute 1), remaining attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fact {
    /// Predicate name
    pub predicate: String,
    /// Owner or destination of the fact
    pub location: Address,
    /// Attributes after the location
    pub attrs: Vec<Value>,
}

impl Fact {
    /// Create a fact
    pub fn new<S: Into<String>>(predicate: S, location: Address, attrs: Vec<Value>) -> Self {
        Self {
            predicate: predicate.into(),
            location,
            attrs,
        }
    }

    /// Number of attributes including the location
    pub fn arity(&self) -> usize {
        self.attrs.len() + 1
    }

    /// Attribute at a 1-based position, where position 1 is the location
    pub fn attr(&self, position: usize) -> Option<Value> {
        match position {
            0 => None,
            1 => Some(Value::Addr(self.location.clone())),
            n => self.attrs.get(n - 2).cloned(),
        }
    }

    /// Same fact, owned by `node`
    pub fn localized(mut self, node: &NodeId) -> Self {
        self.location = Address::Node(node.clone());
        self
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(@{}", self.predicate, self.location)?;
        for attr in &self.attrs {
            write!(f, ", {attr}")?;
        }
        f.write_str(")")
    }
}

/// Wire envelope carrying one fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Wire version
    pub version: u32,
    /// Unique message identifier (duplicates share it)
    pub message_id: Uuid,
    /// Transport-level sender
    pub sender: NodeId,
    /// Payload
    pub fact: Fact,
}

impl Envelope {
    /// Wrap a fact sent by `sender`
    pub fn new(sender: NodeId, fact: Fact) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id: Uuid::new_v4(),
            sender,
            fact,
        }
    }

    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;

        if serialized.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: serialized.len(),
                max: MAX_ENVELOPE_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_SIZE,
            }
            .into());
        }

        let envelope: Self = bincode::deserialize(bytes)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: envelope.version,
            }
            .into());
        }

        Ok(envelope)
    }

    /// Turn the envelope into what the receiving node sees
    pub fn into_delivery(self) -> Delivery {
        Delivery {
            message_id: self.message_id,
            sender: self.sender,
            fact: self.fact,
        }
    }
}

/// An inbound fact paired with the sender the transport observed
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Message identifier from the envelope
    pub message_id: Uuid,
    /// Sender as seen by the transport, independent of the payload
    pub sender: NodeId,
    /// Payload exactly as sent
    pub fact: Fact,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(origin: &str) -> Fact {
        Fact::new(
            "beacon",
            Address::Broadcast,
            vec![Value::Addr(Address::node(origin))],
        )
    }

    #[test]
    fn test_envelope_preserves_fact_and_sender() {
        let envelope = Envelope::new(NodeId::from("B"), beacon("B"));
        let bytes = envelope.to_bytes().unwrap();
        let delivery = Envelope::from_bytes(&bytes).unwrap().into_delivery();

        assert_eq!(delivery.message_id, envelope.message_id);
        assert_eq!(delivery.sender, NodeId::from("B"));
        assert_eq!(delivery.fact, beacon("B"));
        assert_eq!(delivery.fact.location, Address::Broadcast);
    }

    #[test]
    fn test_version_mismatch() {
        let mut envelope = Envelope::new(NodeId::from("B"), beacon("B"));
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&envelope).unwrap();

        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_envelope_size_limit() {
        let fact = Fact::new(
            "blob",
            Address::node("A"),
            vec![Value::Str("x".repeat(MAX_ENVELOPE_SIZE))],
        );
        assert!(Envelope::new(NodeId::from("A"), fact).to_bytes().is_err());
        assert!(Envelope::from_bytes(&vec![0u8; MAX_ENVELOPE_SIZE + 1]).is_err());
    }

    #[test]
    fn test_attribute_positions() {
        let fact = Fact::new(
            "link",
            Address::node("A"),
            vec![Value::Addr(Address::node("B")), Value::Int(1)],
        );
        assert_eq!(fact.arity(), 3);
        assert_eq!(fact.attr(1), Some(Value::Addr(Address::node("A"))));
        assert_eq!(fact.attr(3), Some(Value::Int(1)));
        assert_eq!(fact.attr(0), None);
        assert_eq!(fact.attr(4), None);
        assert_eq!(fact.to_string(), "link(@A, B, 1)");
    }

    #[test]
    fn test_localization_replaces_location_only() {
        let local = NodeId::from("A");
        let fact = beacon("B").localized(&local);
        assert!(fact.location.is_local_to(&local));
        assert_eq!(fact.attrs, vec![Value::Addr(Address::node("B"))]);
    }

    #[test]
    fn test_broadcast_targets_exclude_sender() {
        let mut topology = Topology::new();
        topology.connect(&NodeId::from("A"), &NodeId::from("B"));
        topology.connect(&NodeId::from("A"), &NodeId::from("C"));

        let targets = Address::Broadcast.resolve_targets(&NodeId::from("A"), &topology);
        assert_eq!(targets, vec![NodeId::from("B"), NodeId::from("C")]);

        let targets = Address::node("C").resolve_targets(&NodeId::from("B"), &topology);
        assert_eq!(targets, vec![NodeId::from("C")]);
    }
}
