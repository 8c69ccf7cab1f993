//! Config Events
//!
//! Events emitted by the config store after every successful write, so that
//! observers (hooks, replication to other nodes) can react to changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the config store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigEvent {
    /// A node joined the cluster
    NodeAdded { node: String },

    /// A node was removed from the cluster
    NodeRemoved { node: String },

    /// A new instance was registered
    InstanceAdded { instance: String, primary_node: String },

    /// An instance record was rewritten (disks, nodes)
    InstanceUpdated { instance: String },

    /// An instance changed its administrative status
    InstanceStatusChanged { instance: String, up: bool },

    /// An instance was deleted from the config
    InstanceRemoved { instance: String },

    /// A replication port was handed out
    PortAllocated { port: u16 },
}

impl ConfigEvent {
    /// Name of the object the event refers to, if any
    pub fn subject(&self) -> Option<&str> {
        match self {
            ConfigEvent::NodeAdded { node } | ConfigEvent::NodeRemoved { node } => Some(node),
            ConfigEvent::InstanceAdded { instance, .. }
            | ConfigEvent::InstanceUpdated { instance }
            | ConfigEvent::InstanceStatusChanged { instance, .. }
            | ConfigEvent::InstanceRemoved { instance } => Some(instance),
            ConfigEvent::PortAllocated { .. } => None,
        }
    }

    /// Check if this is an instance-level event
    pub fn is_instance_event(&self) -> bool {
        matches!(
            self,
            ConfigEvent::InstanceAdded { .. }
                | ConfigEvent::InstanceUpdated { .. }
                | ConfigEvent::InstanceStatusChanged { .. }
                | ConfigEvent::InstanceRemoved { .. }
        )
    }
}
