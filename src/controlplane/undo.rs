//! Undo Stack
//!
//! Records the compensating action for every node-side effect an operation
//! performs, so that a failed `exec` can unwind exactly what it did, most
//! recent first. Unwinding is best effort: failures are logged, not raised.

use crate::config::{ConfigStore, Disk};
use crate::domain::ports::NodeRpc;
use tracing::{info, warn};

/// One compensating action
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    /// Remove a device tree created on a node
    RemoveDevice { node: String, disk: Disk },
    /// Detach a member that was attached to a mirror
    DetachChild { node: String, parent: Disk, child: Disk },
    /// Drop an instance registered in the config
    UnregisterInstance { name: String },
    /// Return a reserved MAC address to the pool
    ReleaseMac { mac: String },
}

/// Compensating actions accumulated during one `exec`
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Keep the effects: nothing will be undone
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Run every recorded action in reverse order
    pub async fn unwind(&mut self, rpc: &dyn NodeRpc, config: &ConfigStore) {
        if self.actions.is_empty() {
            return;
        }
        info!("Rolling back {} recorded actions", self.actions.len());

        while let Some(action) = self.actions.pop() {
            match action {
                UndoAction::RemoveDevice { node, disk } => {
                    match rpc.blockdev_remove(&node, &disk).await {
                        Ok(true) => {}
                        Ok(false) => warn!("Could not remove device {} on node {}", disk.key(), node),
                        Err(e) => warn!("Could not remove device {} on node {}: {}", disk.key(), node, e),
                    }
                }
                UndoAction::DetachChild {
                    node,
                    parent,
                    child,
                } => match rpc.blockdev_removechild(&node, &parent, &child).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        "Could not detach {} from {} on node {}",
                        child.key(),
                        parent.key(),
                        node
                    ),
                    Err(e) => warn!(
                        "Could not detach {} from {} on node {}: {}",
                        child.key(),
                        parent.key(),
                        node,
                        e
                    ),
                },
                UndoAction::UnregisterInstance { name } => {
                    if let Err(e) = config.remove_instance(&name) {
                        warn!("Could not remove instance {} from the config: {}", name, e);
                    }
                }
                UndoAction::ReleaseMac { mac } => config.release_mac(&mac),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, DiskTemplate, Instance, InstanceStatus};
    use crate::controlplane::backends::{SimNodeSpec, SimulatedCluster};

    #[tokio::test]
    async fn test_unwind_in_reverse_order() {
        let fleet = SimulatedCluster::new();
        fleet.add_node("n1", SimNodeSpec::default());
        let leg_a = Disk::volume("xenvg", "web1.sda_m1", 100);
        let leg_b = Disk::volume("xenvg", "web1.sda_m2", 100);
        let mirror = Disk::mirror("web1.sda", 100, vec![leg_a.clone()]);
        for disk in [&leg_a, &mirror, &leg_b] {
            assert!(fleet
                .blockdev_create("n1", disk, disk.size, true, "")
                .await
                .unwrap()
                .is_some());
        }
        assert!(fleet.blockdev_addchild("n1", &mirror, &leg_b).await.unwrap());

        let config = ConfigStore::new(ClusterConfig::default());
        config
            .add_instance(Instance {
                name: "web1".into(),
                primary_node: "n1".into(),
                secondary_nodes: Vec::new(),
                memory: 128,
                vcpus: 1,
                disk_template: DiskTemplate::Diskless,
                disks: Vec::new(),
                nics: Vec::new(),
                status: InstanceStatus::Down,
                os: "linux".into(),
            })
            .unwrap();

        let mut undo = UndoStack::new();
        undo.push(UndoAction::RemoveDevice {
            node: "n1".into(),
            disk: leg_b.clone(),
        });
        undo.push(UndoAction::DetachChild {
            node: "n1".into(),
            parent: mirror.clone(),
            child: leg_b.clone(),
        });
        undo.push(UndoAction::UnregisterInstance { name: "web1".into() });
        assert_eq!(undo.len(), 3);

        undo.unwind(&fleet, &config).await;
        assert!(undo.is_empty());
        assert!(config.snapshot().instance("web1").is_none());
        assert_eq!(fleet.attached_children("n1", &mirror), Some(vec![leg_a.key()]));
        assert!(!fleet.has_device("n1", &leg_b));
        assert!(fleet.has_device("n1", &leg_a));
    }

    #[tokio::test]
    async fn test_commit_keeps_effects() {
        let fleet = SimulatedCluster::new();
        fleet.add_node("n1", SimNodeSpec::default());
        let volume = Disk::volume("xenvg", "web1.sda", 100);
        fleet.blockdev_create("n1", &volume, 100, true, "").await.unwrap();

        let mut undo = UndoStack::new();
        undo.push(UndoAction::RemoveDevice {
            node: "n1".into(),
            disk: volume.clone(),
        });
        undo.commit();
        undo.unwind(&fleet, &ConfigStore::new(ClusterConfig::default())).await;
        assert!(fleet.has_device("n1", &volume));
    }
}
