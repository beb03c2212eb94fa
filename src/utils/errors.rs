//! Error types and handling for the discovery runtime.
//!
//! Every layer owns a small error enum; [`DiscoveryError`] wraps them so the
//! public API can return a single [`Result`] type.

use thiserror::Error;

/// Result type alias for the discovery library
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Umbrella error type for all discovery operations
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// Rule program could not be parsed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Rule program parsed but failed semantic checks
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Node registry and transport errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Wire-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Materialized relation errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Syntax error in a rule program, positioned at the offending token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    /// 1-based line of the offending token
    pub line: usize,
    /// 1-based column of the offending token
    pub column: usize,
    /// What was expected or found
    pub message: String,
}

/// Semantic errors detected while compiling a parsed program
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Head or assignment uses a variable no body conjunct binds
    #[error("rule {rule}: variable {variable} is not bound by the body")]
    UnboundVariable { rule: String, variable: String },

    /// Wildcard used where a value is required
    #[error("rule {rule}: wildcard is not allowed in {place}")]
    WildcardNotAllowed { rule: String, place: String },

    /// Head location is not an address expression
    #[error("rule {rule}: invalid head location: {reason}")]
    InvalidLocation { rule: String, reason: String },

    /// Periodic source with non-constant or out-of-range parameters
    #[error("invalid periodic source: {reason}")]
    InvalidTimer { reason: String },

    /// Materialized key refers to a position the relation does not have
    #[error("relation {relation}: invalid key position {position}")]
    InvalidKey { relation: String, position: usize },

    /// Relation with room for no rows
    #[error("relation {relation}: size must be positive or infinity")]
    InvalidSize { relation: String },

    /// Relation declared twice
    #[error("relation {relation} is materialized more than once")]
    DuplicateTable { relation: String },

    /// Rule has an empty body
    #[error("rule {rule}: body must contain at least one conjunct")]
    EmptyBody { rule: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Node registry and delivery errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Node is not part of the simulation or not attached
    #[error("Unknown node: {node}")]
    UnknownNode { node: String },

    /// Node already attached to the transport
    #[error("Node already attached: {node}")]
    AlreadyAttached { node: String },

    /// Node task is gone
    #[error("Node stopped: {node}")]
    NodeStopped { node: String },
}

/// Wire-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported envelope version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Envelope could not be encoded or decoded
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    /// Envelope too large
    #[error("Envelope too large: {size} bytes (max: {max})")]
    EnvelopeTooLarge { size: usize, max: usize },
}

/// Materialized relation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Fact is too short for the relation's key
    #[error("{relation}: key position {position} exceeds fact arity {arity}")]
    KeyOutOfRange {
        relation: String,
        position: usize,
        arity: usize,
    },

    /// Fact belongs to another relation
    #[error("{relation}: cannot store a {predicate} fact")]
    WrongRelation { relation: String, predicate: String },
}

impl DiscoveryError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if a running simulation can continue past this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::Store(_)
                | Self::Network(NetworkError::UnknownNode { .. })
                | Self::Network(NetworkError::NodeStopped { .. })
        )
    }

    /// Returns true if this error was raised while loading a rule program
    pub fn is_load_error(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Compile(_))
    }
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DiscoveryError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidEnvelope {
            reason: err.to_string(),
        })
    }
}
