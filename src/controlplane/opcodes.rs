//! Opcodes
//!
//! The request surface of the control plane. Each request is one variant of
//! [`OpCode`], tagged by `op` in JSON, with a static [`OpSchema`] naming its
//! required fields and the gates the processor enforces before running it.

use super::cluster::query::{QueryInstances, QueryNodes, RemoveNode};
use super::cluster::verify::VerifyCluster;
use super::instance::create::CreateInstance;
use super::instance::failover::FailoverInstance;
use super::instance::lifecycle::{
    ActivateDisks, DeactivateDisks, RemoveInstance, ShutdownInstance, StartInstance,
};
use super::instance::mirror::{AddMirrorLeg, RemoveMirrorLeg, ReplaceDisks};
use super::operation::LogicalOperation;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Schema
// =============================================================================

/// Static description of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSchema {
    /// Value of the `op` tag
    pub name: &'static str,
    /// Fields that must be present and non-null
    pub required: &'static [&'static str],
    /// Refuse to run before the cluster is initialized
    pub needs_cluster: bool,
    /// Refuse to run anywhere but on the master node
    pub needs_master: bool,
}

const fn mutating(name: &'static str, required: &'static [&'static str]) -> OpSchema {
    OpSchema {
        name,
        required,
        needs_cluster: true,
        needs_master: true,
    }
}

const fn query(name: &'static str, required: &'static [&'static str]) -> OpSchema {
    OpSchema {
        name,
        required,
        needs_cluster: true,
        needs_master: false,
    }
}

/// All known opcodes
pub static SCHEMAS: &[OpSchema] = &[
    mutating(
        "instance_create",
        &[
            "instance_name",
            "mem_size",
            "disk_size",
            "swap_size",
            "primary_node",
            "disk_template",
            "mode",
            "start",
            "vcpus",
            "wait_for_sync",
        ],
    ),
    mutating("instance_start", &["instance_name", "force"]),
    mutating("instance_shutdown", &["instance_name"]),
    mutating("instance_remove", &["instance_name"]),
    mutating("instance_failover", &["instance_name", "ignore_consistency"]),
    mutating(
        "instance_add_mirror_leg",
        &["instance_name", "remote_node", "disk_name"],
    ),
    mutating(
        "instance_remove_mirror_leg",
        &["instance_name", "disk_name", "disk_id"],
    ),
    mutating("instance_replace_disks", &["instance_name"]),
    mutating("cluster_verify", &[]),
    mutating("instance_activate_disks", &["instance_name"]),
    mutating("instance_deactivate_disks", &["instance_name"]),
    query("instance_query", &[]),
    query("node_query", &[]),
    mutating("node_remove", &["node_name"]),
];

impl OpSchema {
    pub fn lookup(name: &str) -> Option<&'static OpSchema> {
        SCHEMAS.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCreate {
    pub instance_name: String,
    /// Memory in MiB
    pub mem_size: u64,
    /// Data disk size in MiB
    pub disk_size: u64,
    /// Swap disk size in MiB
    pub swap_size: u64,
    pub primary_node: String,
    pub disk_template: String,
    /// `create` or `import`
    pub mode: String,
    pub start: bool,
    pub vcpus: u32,
    pub wait_for_sync: bool,
    #[serde(default)]
    pub secondary_node: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub src_node: Option<String>,
    #[serde(default)]
    pub src_path: Option<String>,
    /// IPv4 address, or `none`
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStart {
    pub instance_name: String,
    /// Tolerate failures on secondary nodes while assembling
    pub force: bool,
    #[serde(default)]
    pub extra_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceName {
    pub instance_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemove {
    pub instance_name: String,
    /// Carry on when the instance cannot be stopped
    #[serde(default)]
    pub ignore_failures: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFailover {
    pub instance_name: String,
    /// Fail over even when the target's mirror is degraded
    pub ignore_consistency: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddMirrorLeg {
    pub instance_name: String,
    pub remote_node: String,
    pub disk_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemoveMirrorLeg {
    pub instance_name: String,
    pub disk_name: String,
    /// Replication port of the leg to remove
    pub disk_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReplaceDisks {
    pub instance_name: String,
    /// New secondary; defaults to the current one
    #[serde(default)]
    pub remote_node: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameFilter {
    /// Restrict to these names; empty means everything
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRemove {
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

// =============================================================================
// OpCode
// =============================================================================

/// A canonical operation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpCode {
    InstanceCreate(InstanceCreate),
    InstanceStart(InstanceStart),
    InstanceShutdown(InstanceName),
    InstanceRemove(InstanceRemove),
    InstanceFailover(InstanceFailover),
    InstanceAddMirrorLeg(InstanceAddMirrorLeg),
    InstanceRemoveMirrorLeg(InstanceRemoveMirrorLeg),
    InstanceReplaceDisks(InstanceReplaceDisks),
    ClusterVerify(Empty),
    InstanceActivateDisks(InstanceName),
    InstanceDeactivateDisks(InstanceName),
    InstanceQuery(NameFilter),
    NodeQuery(NameFilter),
    NodeRemove(NodeRemove),
}

impl OpCode {
    /// Value of the `op` tag
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::InstanceCreate(_) => "instance_create",
            OpCode::InstanceStart(_) => "instance_start",
            OpCode::InstanceShutdown(_) => "instance_shutdown",
            OpCode::InstanceRemove(_) => "instance_remove",
            OpCode::InstanceFailover(_) => "instance_failover",
            OpCode::InstanceAddMirrorLeg(_) => "instance_add_mirror_leg",
            OpCode::InstanceRemoveMirrorLeg(_) => "instance_remove_mirror_leg",
            OpCode::InstanceReplaceDisks(_) => "instance_replace_disks",
            OpCode::ClusterVerify(_) => "cluster_verify",
            OpCode::InstanceActivateDisks(_) => "instance_activate_disks",
            OpCode::InstanceDeactivateDisks(_) => "instance_deactivate_disks",
            OpCode::InstanceQuery(_) => "instance_query",
            OpCode::NodeQuery(_) => "node_query",
            OpCode::NodeRemove(_) => "node_remove",
        }
    }

    pub fn schema(&self) -> Result<&'static OpSchema> {
        OpSchema::lookup(self.name())
            .ok_or_else(|| Error::Invariant(format!("opcode {} has no schema", self.name())))
    }

    /// Parse a request, checking its required fields against the schema
    /// before deserializing
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let op = value
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::prereq("Request has no 'op' field"))?;
        let schema = OpSchema::lookup(op)
            .ok_or_else(|| Error::prereq(format!("Unknown opcode '{}'", op)))?;

        for field in schema.required {
            match value.get(*field) {
                None | Some(serde_json::Value::Null) => {
                    return Err(Error::prereq(format!(
                        "Required parameter '{}' missing for {}",
                        field, schema.name
                    )));
                }
                Some(_) => {}
            }
        }

        serde_json::from_value(value)
            .map_err(|e| Error::prereq(format!("Invalid parameters for {}: {}", schema.name, e)))
    }

    /// Turn the request into its executable operation
    pub fn into_operation(self) -> Box<dyn LogicalOperation> {
        match self {
            OpCode::InstanceCreate(req) => Box::new(CreateInstance::new(req)),
            OpCode::InstanceStart(req) => Box::new(StartInstance::new(req)),
            OpCode::InstanceShutdown(req) => Box::new(ShutdownInstance::new(req)),
            OpCode::InstanceRemove(req) => Box::new(RemoveInstance::new(req)),
            OpCode::InstanceFailover(req) => Box::new(FailoverInstance::new(req)),
            OpCode::InstanceAddMirrorLeg(req) => Box::new(AddMirrorLeg::new(req)),
            OpCode::InstanceRemoveMirrorLeg(req) => Box::new(RemoveMirrorLeg::new(req)),
            OpCode::InstanceReplaceDisks(req) => Box::new(ReplaceDisks::new(req)),
            OpCode::ClusterVerify(_) => Box::new(VerifyCluster::new()),
            OpCode::InstanceActivateDisks(req) => Box::new(ActivateDisks::new(req)),
            OpCode::InstanceDeactivateDisks(req) => Box::new(DeactivateDisks::new(req)),
            OpCode::InstanceQuery(req) => Box::new(QueryInstances::new(req)),
            OpCode::NodeQuery(req) => Box::new(QueryNodes::new(req)),
            OpCode::NodeRemove(req) => Box::new(RemoveNode::new(req)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_every_opcode_has_a_schema() {
        let ops = [
            OpCode::ClusterVerify(Empty {}),
            OpCode::InstanceShutdown(InstanceName {
                instance_name: "web1".into(),
            }),
            OpCode::InstanceQuery(NameFilter::default()),
            OpCode::NodeRemove(NodeRemove {
                node_name: "node3".into(),
            }),
        ];
        for op in ops {
            assert_eq!(op.schema().unwrap().name, op.name());
        }
        assert_eq!(SCHEMAS.len(), 14);
    }

    #[test]
    fn test_from_json_start() {
        let op = OpCode::from_json(r#"{"op":"instance_start","instance_name":"web1","force":false}"#)
            .unwrap();
        assert_eq!(
            op,
            OpCode::InstanceStart(InstanceStart {
                instance_name: "web1".into(),
                force: false,
                extra_args: None,
            })
        );
    }

    #[test]
    fn test_from_json_missing_field_is_prereq_error() {
        let result = OpCode::from_json(r#"{"op":"instance_failover","instance_name":"web1"}"#);
        assert_matches!(result, Err(Error::Prereq(msg)) if msg.contains("ignore_consistency"));

        let result = OpCode::from_json(r#"{"op":"instance_start","instance_name":null,"force":true}"#);
        assert_matches!(result, Err(Error::Prereq(_)));
    }

    #[test]
    fn test_from_json_unknown_op() {
        assert_matches!(
            OpCode::from_json(r#"{"op":"instance_reboot"}"#),
            Err(Error::Prereq(_))
        );
        assert_matches!(OpCode::from_json(r#"{"name":"x"}"#), Err(Error::Prereq(_)));
        assert_matches!(OpCode::from_json("not json"), Err(Error::JsonParse(_)));
    }

    #[test]
    fn test_from_json_create_optional_fields() {
        let raw = r#"{
            "op": "instance_create",
            "instance_name": "web1",
            "mem_size": 512,
            "disk_size": 10240,
            "swap_size": 1024,
            "primary_node": "n1",
            "disk_template": "remote-mirror",
            "secondary_node": "n2",
            "mode": "create",
            "os_type": "linux",
            "start": true,
            "vcpus": 1,
            "wait_for_sync": true
        }"#;
        let op = OpCode::from_json(raw).unwrap();
        assert_matches!(op, OpCode::InstanceCreate(req) => {
            assert_eq!(req.secondary_node.as_deref(), Some("n2"));
            assert_eq!(req.ip, None);
            assert_eq!(req.bridge, None);
        });
    }

    #[test]
    fn test_verify_has_no_fields() {
        let op = OpCode::from_json(r#"{"op":"cluster_verify"}"#).unwrap();
        assert_eq!(op, OpCode::ClusterVerify(Empty {}));
        let schema = op.schema().unwrap();
        assert!(schema.needs_master);
        assert!(schema.required.is_empty());
    }

    #[test]
    fn test_wrong_type_is_prereq_error() {
        let result = OpCode::from_json(
            r#"{"op":"instance_remove_mirror_leg","instance_name":"web1","disk_name":"sda","disk_id":"x"}"#,
        );
        assert_matches!(result, Err(Error::Prereq(_)));
    }
}
