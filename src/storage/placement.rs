//! Device Placement
//!
//! Pure functions deriving which nodes each level of a disk tree lives on.
//! Replicated pairs live on both of their endpoints; every other device
//! lives on the node of its parent (the primary, for top-level disks).

use crate::config::{DeviceKind, Disk, Instance};
use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Role a node plays for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// The node running the instance
    Primary,
    /// A node holding a replica only
    Secondary,
}

/// A device to act upon on a specific node
#[derive(Debug, Clone, PartialEq)]
pub struct Placement<'a> {
    pub node: String,
    /// Topmost device of the tree living on `node`
    pub disk: &'a Disk,
    pub role: DeviceRole,
}

/// Nodes a single device lives on, given the node of its parent
pub fn nodes_for<'a>(disk: &'a Disk, parent_node: &'a str) -> Result<Vec<&'a str>> {
    match disk.kind {
        DeviceKind::LogicalVolume | DeviceKind::Mirror => Ok(vec![parent_node]),
        DeviceKind::Replicated => {
            let (a, b) = disk.replicated_nodes().ok_or_else(|| {
                Error::Invariant(format!("replicated device {} has no endpoints", disk.key()))
            })?;
            if parent_node != a && parent_node != b {
                return Err(Error::Invariant(format!(
                    "replicated device {} passed unknown node {}",
                    disk.key(),
                    parent_node
                )));
            }
            Ok(vec![a, b])
        }
    }
}

/// Compact list of `(node, device)` pairs describing a tree: on each node,
/// only the topmost device living there is listed, since acting on it
/// recursively covers its descendants on that node.
///
/// A mirror over a replicated pair yields `(primary, mirror)` and
/// `(secondary, pair)`.
pub fn node_tree<'a>(disk: &'a Disk, parent_node: &str) -> Result<Vec<(String, &'a Disk)>> {
    let my_nodes: Vec<String> = nodes_for(disk, parent_node)?
        .into_iter()
        .map(String::from)
        .collect();
    let mut result: Vec<(String, &'a Disk)> =
        my_nodes.iter().map(|node| (node.clone(), disk)).collect();

    for node in &my_nodes {
        for child in &disk.children {
            let child_result = node_tree(child, node)?;
            if child_result.len() == 1 {
                // the child does not spread beyond this node
                continue;
            }
            for (subnode, subdisk) in child_result {
                let known = result
                    .iter()
                    .any(|(n, d)| *n == subnode && std::ptr::eq(*d, subdisk));
                if !my_nodes.contains(&subnode) && !known {
                    result.push((subnode, subdisk));
                }
            }
        }
    }
    Ok(result)
}

/// Every `(node, device, role)` the instance's disks need acting upon
pub fn instance_placements(instance: &Instance) -> Result<Vec<Placement<'_>>> {
    let mut placements = Vec::new();
    for disk in &instance.disks {
        for (node, top) in node_tree(disk, &instance.primary_node)? {
            let role = if node == instance.primary_node {
                DeviceRole::Primary
            } else {
                DeviceRole::Secondary
            };
            placements.push(Placement {
                node,
                disk: top,
                role,
            });
        }
    }
    Ok(placements)
}

/// Logical volumes each node is expected to hold for the instance
///
/// The primary node always has an entry, even for diskless instances.
pub fn volumes_by_node(instance: &Instance) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    map.entry(instance.primary_node.clone()).or_default();
    map_volumes(&instance.disks, &instance.primary_node, &mut map);
    map
}

fn map_volumes(disks: &[Disk], node: &str, map: &mut BTreeMap<String, Vec<String>>) {
    for disk in disks {
        match disk.kind {
            DeviceKind::LogicalVolume => {
                if let Some(name) = disk.volume_name() {
                    map.entry(node.to_string()).or_default().push(name.to_string());
                }
            }
            DeviceKind::Replicated => {
                if let Some((a, b)) = disk.replicated_nodes() {
                    map.entry(a.to_string()).or_default();
                    map.entry(b.to_string()).or_default();
                    map_volumes(&disk.children, a, map);
                    map_volumes(&disk.children, b, map);
                }
            }
            DeviceKind::Mirror => map_volumes(&disk.children, node, map),
        }
    }
}
