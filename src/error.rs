//! Error types for the cluster control plane
//!
//! Every logical operation reports failures through one of four classes:
//! prerequisite failures (nothing was changed), execution failures (node-side
//! effects may be partially applied), remote failures (a node could not be
//! reached) and invariant violations (a bug in the control plane itself).

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Operation Errors
    // =========================================================================
    /// Validation failed before any mutation took place
    #[error("Prerequisites not met: {0}")]
    Prereq(String),

    /// A mutation failed part-way; compensation was attempted
    #[error("Execution failed: {0}")]
    Exec(String),

    /// A node could not be reached at all
    #[error("Remote error on node {node}: {reason}")]
    Remote { node: String, reason: String },

    /// An internal assumption was violated
    #[error("Programmer error: {0}")]
    Invariant(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Instance not found: {name}")]
    InstanceNotFound { name: String },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a prerequisite failure
    pub fn prereq(msg: impl Into<String>) -> Self {
        Error::Prereq(msg.into())
    }

    /// Shorthand for an execution failure
    pub fn exec(msg: impl Into<String>) -> Self {
        Error::Exec(msg.into())
    }

    /// Shorthand for an unreachable node
    pub fn remote(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Remote {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Only unreachable nodes are worth retrying; everything else needs a
    /// changed request or admin intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }

    /// Whether the failure happened before anything was mutated
    pub fn guarantees_no_change(&self) -> bool {
        matches!(
            self,
            Error::Prereq(_) | Error::InstanceNotFound { .. } | Error::NodeNotFound { .. }
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
