//! Storage layer
//!
//! Disk tree generation, node placement and the block device orchestrator
//! driving devices on the nodes.

pub mod blockdev;
pub mod placement;
pub mod templates;

pub use blockdev::{BlockDeviceOrchestrator, DiskDevice, SyncPolicy};
pub use placement::{instance_placements, node_tree, nodes_for, volumes_by_node, DeviceRole, Placement};
pub use templates::{
    generate_disk_template, generate_replicated_branch, required_free_space, REPLICATION_OVERHEAD,
};
