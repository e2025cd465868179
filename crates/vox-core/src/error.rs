//! Error types for the vox engine
//!
//! Every variant is local and recoverable. Callers either retry next
//! frame, drop the work item, or fall back to a degraded behavior.

use thiserror::Error;

use crate::ids::NodeId;

/// Core error type
#[derive(Error, Debug)]
pub enum VoxError {
    #[error("ID not found: {0}")]
    IdNotFound(u64),

    #[error("Insufficient memory: {0}")]
    InsufficientMemory(&'static str),

    #[error("Codec not registered: company {company}, plugin {plugin}")]
    CodecNotRegistered { company: u16, plugin: u16 },

    #[error("Plugin not registered: {0}")]
    PluginNotRegistered(u32),

    #[error("Node {0} is already connected")]
    AlreadyConnected(NodeId),

    #[error("Node {child} already has a parent ({parent})")]
    ChildAlreadyHasAParent { child: NodeId, parent: NodeId },

    #[error("Node {0} cannot be added as its own child")]
    CannotAddItselfAsAChild(NodeId),

    #[error("Routing {from} to {to} would create a cycle")]
    WouldCreateCycle { from: NodeId, to: NodeId },

    #[error("Duplicate unique ID: {0}")]
    DuplicateUniqueId(u32),

    #[error("Bank data truncated: needed {needed} bytes, {remaining} remaining")]
    BankDataTruncated { needed: usize, remaining: usize },

    #[error("Bank block size mismatch: declared {declared}, consumed {consumed}")]
    BankSizeMismatch { declared: usize, consumed: usize },

    #[error("Source format not ready")]
    FormatNotReady,

    #[error("Source failed: {0}")]
    SourceFailed(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for VoxError {
    fn from(err: serde_json::Error) -> Self {
        VoxError::Serialization(err.to_string())
    }
}

/// Result type alias
pub type VoxResult<T> = Result<T, VoxError>;
