//! Timeout Guard
//!
//! Decorates any [`NodeRpc`] so that no call can hang an operation: a call
//! exceeding the deadline surfaces as `Error::Remote` for its node.

use crate::config::{Disk, Instance};
use crate::domain::ports::{
    DeviceStatus, ExportInfo, InstanceRuntime, NodeInfo, NodeRpc, NodeRpcRef, NodeVerifyParams,
    NodeVerifyResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default deadline for a single node call
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// [`NodeRpc`] decorator bounding every call by a deadline
pub struct TimeoutRpc {
    inner: NodeRpcRef,
    timeout: Duration,
}

impl TimeoutRpc {
    pub fn new(inner: NodeRpcRef, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Wrap and hand back as a shared port
    pub fn wrap(inner: NodeRpcRef, timeout: Duration) -> NodeRpcRef {
        Arc::new(Self::new(inner, timeout))
    }

    async fn guard<T>(&self, node: &str, call: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Call {} to node {} timed out after {:?}", call, node, self.timeout);
                Err(Error::remote(
                    node,
                    format!("{} timed out after {:?}", call, self.timeout),
                ))
            }
        }
    }
}

#[async_trait]
impl NodeRpc for TimeoutRpc {
    async fn version(&self, node: &str) -> Result<String> {
        self.guard(node, "version", self.inner.version(node)).await
    }

    async fn node_info(&self, node: &str, vg_name: &str) -> Result<Option<NodeInfo>> {
        self.guard(node, "node_info", self.inner.node_info(node, vg_name)).await
    }

    async fn vg_list(&self, node: &str) -> Result<BTreeMap<String, u64>> {
        self.guard(node, "vg_list", self.inner.vg_list(node)).await
    }

    async fn volume_list(&self, node: &str, vg_name: &str) -> Result<BTreeMap<String, u64>> {
        self.guard(node, "volume_list", self.inner.volume_list(node, vg_name)).await
    }

    async fn bridges_exist(&self, node: &str, bridges: &[String]) -> Result<bool> {
        self.guard(node, "bridges_exist", self.inner.bridges_exist(node, bridges)).await
    }

    async fn blockdev_create(
        &self,
        node: &str,
        disk: &Disk,
        size: u64,
        on_primary: bool,
        info: &str,
    ) -> Result<Option<String>> {
        self.guard(
            node,
            "blockdev_create",
            self.inner.blockdev_create(node, disk, size, on_primary, info),
        )
        .await
    }

    async fn blockdev_assemble(
        &self,
        node: &str,
        disk: &Disk,
        on_primary: bool,
    ) -> Result<Option<String>> {
        self.guard(
            node,
            "blockdev_assemble",
            self.inner.blockdev_assemble(node, disk, on_primary),
        )
        .await
    }

    async fn blockdev_shutdown(&self, node: &str, disk: &Disk) -> Result<bool> {
        self.guard(node, "blockdev_shutdown", self.inner.blockdev_shutdown(node, disk)).await
    }

    async fn blockdev_remove(&self, node: &str, disk: &Disk) -> Result<bool> {
        self.guard(node, "blockdev_remove", self.inner.blockdev_remove(node, disk)).await
    }

    async fn blockdev_find(&self, node: &str, disk: &Disk) -> Result<Option<DeviceStatus>> {
        self.guard(node, "blockdev_find", self.inner.blockdev_find(node, disk)).await
    }

    async fn blockdev_mirror_status(
        &self,
        node: &str,
        disks: &[Disk],
    ) -> Result<Vec<Option<DeviceStatus>>> {
        self.guard(
            node,
            "blockdev_mirror_status",
            self.inner.blockdev_mirror_status(node, disks),
        )
        .await
    }

    async fn blockdev_addchild(&self, node: &str, parent: &Disk, child: &Disk) -> Result<bool> {
        self.guard(
            node,
            "blockdev_addchild",
            self.inner.blockdev_addchild(node, parent, child),
        )
        .await
    }

    async fn blockdev_removechild(&self, node: &str, parent: &Disk, child: &Disk) -> Result<bool> {
        self.guard(
            node,
            "blockdev_removechild",
            self.inner.blockdev_removechild(node, parent, child),
        )
        .await
    }

    async fn instance_start(
        &self,
        node: &str,
        instance: &Instance,
        extra_args: Option<&str>,
    ) -> Result<bool> {
        self.guard(
            node,
            "instance_start",
            self.inner.instance_start(node, instance, extra_args),
        )
        .await
    }

    async fn instance_shutdown(&self, node: &str, instance: &Instance) -> Result<bool> {
        self.guard(node, "instance_shutdown", self.inner.instance_shutdown(node, instance)).await
    }

    async fn instance_list(&self, node: &str) -> Result<Vec<String>> {
        self.guard(node, "instance_list", self.inner.instance_list(node)).await
    }

    async fn instance_info(&self, node: &str, name: &str) -> Result<Option<InstanceRuntime>> {
        self.guard(node, "instance_info", self.inner.instance_info(node, name)).await
    }

    async fn os_get(&self, node: &str, os: &str) -> Result<bool> {
        self.guard(node, "os_get", self.inner.os_get(node, os)).await
    }

    async fn os_add(
        &self,
        node: &str,
        instance: &Instance,
        os_disk: &str,
        swap_disk: &str,
    ) -> Result<bool> {
        self.guard(node, "os_add", self.inner.os_add(node, instance, os_disk, swap_disk)).await
    }

    async fn os_import(
        &self,
        node: &str,
        instance: &Instance,
        os_disk: &str,
        swap_disk: &str,
        src_node: &str,
        src_path: &str,
    ) -> Result<bool> {
        self.guard(
            node,
            "os_import",
            self.inner
                .os_import(node, instance, os_disk, swap_disk, src_node, src_path),
        )
        .await
    }

    async fn export_info(&self, node: &str, path: &str) -> Result<Option<ExportInfo>> {
        self.guard(node, "export_info", self.inner.export_info(node, path)).await
    }

    async fn config_file_list(&self, node: &str) -> Result<BTreeMap<String, String>> {
        self.guard(node, "config_file_list", self.inner.config_file_list(node)).await
    }

    async fn node_verify(&self, node: &str, params: &NodeVerifyParams) -> Result<NodeVerifyResult> {
        self.guard(node, "node_verify", self.inner.node_verify(node, params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::simulated::{SimNodeSpec, SimulatedCluster};
    use assert_matches::assert_matches;

    /// Never answers `version`
    struct Hanging;

    #[async_trait]
    impl NodeRpc for Hanging {
        async fn version(&self, _node: &str) -> Result<String> {
            futures::future::pending().await
        }
        async fn node_info(&self, _: &str, _: &str) -> Result<Option<NodeInfo>> {
            Ok(None)
        }
        async fn vg_list(&self, _: &str) -> Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }
        async fn volume_list(&self, _: &str, _: &str) -> Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }
        async fn bridges_exist(&self, _: &str, _: &[String]) -> Result<bool> {
            Ok(true)
        }
        async fn blockdev_create(&self, _: &str, _: &Disk, _: u64, _: bool, _: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn blockdev_assemble(&self, _: &str, _: &Disk, _: bool) -> Result<Option<String>> {
            Ok(None)
        }
        async fn blockdev_shutdown(&self, _: &str, _: &Disk) -> Result<bool> {
            Ok(true)
        }
        async fn blockdev_remove(&self, _: &str, _: &Disk) -> Result<bool> {
            Ok(true)
        }
        async fn blockdev_find(&self, _: &str, _: &Disk) -> Result<Option<DeviceStatus>> {
            Ok(None)
        }
        async fn blockdev_mirror_status(&self, _: &str, _: &[Disk]) -> Result<Vec<Option<DeviceStatus>>> {
            Ok(vec![])
        }
        async fn blockdev_addchild(&self, _: &str, _: &Disk, _: &Disk) -> Result<bool> {
            Ok(false)
        }
        async fn blockdev_removechild(&self, _: &str, _: &Disk, _: &Disk) -> Result<bool> {
            Ok(false)
        }
        async fn instance_start(&self, _: &str, _: &Instance, _: Option<&str>) -> Result<bool> {
            Ok(false)
        }
        async fn instance_shutdown(&self, _: &str, _: &Instance) -> Result<bool> {
            Ok(false)
        }
        async fn instance_list(&self, _: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
        async fn instance_info(&self, _: &str, _: &str) -> Result<Option<InstanceRuntime>> {
            Ok(None)
        }
        async fn os_get(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn os_add(&self, _: &str, _: &Instance, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn os_import(&self, _: &str, _: &Instance, _: &str, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        async fn export_info(&self, _: &str, _: &str) -> Result<Option<ExportInfo>> {
            Ok(None)
        }
        async fn config_file_list(&self, _: &str) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
        async fn node_verify(&self, _: &str, _: &NodeVerifyParams) -> Result<NodeVerifyResult> {
            Ok(NodeVerifyResult::default())
        }
    }

    #[tokio::test]
    async fn test_timeout_becomes_remote_error() {
        let rpc = TimeoutRpc::new(Arc::new(Hanging), Duration::from_millis(20));
        let result = rpc.version("node1").await;
        assert_matches!(result, Err(Error::Remote { node, .. }) if node == "node1");
    }

    #[tokio::test]
    async fn test_passes_answers_through() {
        let fleet = Arc::new(SimulatedCluster::new());
        fleet.add_node("node1", SimNodeSpec::default());
        let rpc = TimeoutRpc::wrap(fleet, DEFAULT_RPC_TIMEOUT);
        assert_eq!(rpc.version("node1").await.unwrap(), crate::VERSION);
        assert!(rpc
            .bridges_exist("node1", &["xen-br0".to_string()])
            .await
            .unwrap());
    }
}
