//! Instance Creation
//!
//! Creates a new instance from scratch or from an export: generates the disk
//! tree, creates the devices on every node, registers the instance, waits
//! for the initial mirror sync, installs the guest OS and optionally starts
//! it.

use super::instance_env;
use crate::config::{ClusterConfig, DiskTemplate, Instance, InstanceStatus, Nic};
use crate::controlplane::hooks::HooksEnv;
use crate::controlplane::locks::LockScope;
use crate::controlplane::opcodes::InstanceCreate;
use crate::controlplane::operation::{checked, expand_node, Context, Feedback, LogicalOperation, OpResult};
use crate::controlplane::undo::{UndoAction, UndoStack};
use crate::error::{Error, Result};
use crate::storage::{generate_disk_template, required_free_space};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use tracing::{error, info, warn};

/// How the instance's disks get their content
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    /// Fresh OS installation
    Install,
    /// Import of an export found on `node` at `path`
    Import { node: String, path: String },
}

/// Canonical request, filled in by `check_prereq`
#[derive(Debug, Clone)]
struct Plan {
    template: DiskTemplate,
    primary: String,
    secondaries: Vec<String>,
    os: String,
    bridge: String,
    ip: Option<String>,
    source: Source,
}

pub struct CreateInstance {
    req: InstanceCreate,
    plan: Option<Plan>,
}

impl CreateInstance {
    pub fn new(req: InstanceCreate) -> Self {
        Self { req, plan: None }
    }

    async fn resolve_source(&self, ctx: &Context) -> Result<(Source, String)> {
        match self.req.mode.as_str() {
            "create" => {
                let os = self
                    .req
                    .os_type
                    .clone()
                    .ok_or_else(|| Error::prereq("No guest OS specified"))?;
                Ok((Source::Install, os))
            }
            "import" => {
                let (src_node, src_path) = match (&self.req.src_node, &self.req.src_path) {
                    (Some(node), Some(path)) => (node, path),
                    _ => {
                        return Err(Error::prereq(
                            "In import mode, the source node and path options are required",
                        ))
                    }
                };
                let node = ctx
                    .config
                    .expand_node_name(src_node)
                    .ok_or_else(|| Error::prereq(format!("Unknown source node '{}'", src_node)))?;
                let export = ctx
                    .rpc
                    .export_info(&node, src_path)
                    .await
                    .ok()
                    .flatten()
                    .ok_or_else(|| Error::prereq(format!("No export found in dir {}", src_path)))?;
                let os = self.req.os_type.clone().unwrap_or(export.os);
                Ok((
                    Source::Import {
                        node,
                        path: src_path.clone(),
                    },
                    os,
                ))
            }
            other => Err(Error::prereq(format!(
                "Invalid instance creation mode '{}'",
                other
            ))),
        }
    }

    fn resolve_ip(&self, config: &ClusterConfig) -> Result<Option<String>> {
        let raw = match self.req.ip.as_deref() {
            None => return Ok(None),
            Some(ip) if ip.eq_ignore_ascii_case("none") => return Ok(None),
            Some(ip) => ip,
        };
        let ip: Ipv4Addr = raw
            .parse()
            .map_err(|_| Error::prereq(format!("Given IP address '{}' doesn't look like an IP address", raw)))?;
        let ip = ip.to_string();
        let in_use = config
            .instances
            .iter()
            .flat_map(|i| i.nics.iter())
            .any(|nic| nic.ip.as_deref() == Some(ip.as_str()));
        if in_use {
            return Err(Error::prereq(format!("IP {} already in use", ip)));
        }
        Ok(Some(ip))
    }
}

#[async_trait]
impl LogicalOperation for CreateInstance {
    fn name(&self) -> &'static str {
        "instance_create"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("instance-add")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        let mut scope = LockScope::new().instance(self.req.instance_name.clone());
        for node in [Some(&self.req.primary_node), self.req.secondary_node.as_ref()]
            .into_iter()
            .flatten()
        {
            scope = scope.node(config.expand_node_name(node).unwrap_or_else(|| node.clone()));
        }
        scope
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let (source, os) = self.resolve_source(ctx).await?;
        let template: DiskTemplate = self.req.disk_template.parse()?;

        let primary = expand_node(&ctx.config, &self.req.primary_node)
            .map_err(|_| Error::prereq(format!("Primary node '{}' is unknown", self.req.primary_node)))?;

        let mut secondaries = Vec::new();
        if template.has_secondary() {
            let requested = self
                .req
                .secondary_node
                .as_ref()
                .ok_or_else(|| Error::prereq("The networked disk templates need a mirror node"))?;
            let secondary = expand_node(&ctx.config, requested)
                .map_err(|_| Error::prereq(format!("Unknown secondary node '{}'", requested)))?;
            if secondary == primary {
                return Err(Error::prereq("The secondary node cannot be the primary node."));
            }
            secondaries.push(secondary);
        } else if let Some(requested) = &self.req.secondary_node {
            warn!(
                "Ignoring secondary node {} for template {}",
                requested, template
            );
        }

        let config = ctx.config.snapshot();
        if config.instance(&self.req.instance_name).is_some() {
            return Err(Error::prereq(format!(
                "Instance '{}' is already in the cluster",
                self.req.instance_name
            )));
        }
        let ip = self.resolve_ip(&config)?;

        let required = required_free_space(template, self.req.disk_size, self.req.swap_size);
        let mut participating = vec![primary.clone()];
        participating.extend(secondaries.iter().cloned());
        for node in &participating {
            let info = ctx
                .rpc
                .node_info(node, &config.vg_name)
                .await
                .ok()
                .flatten()
                .ok_or_else(|| {
                    Error::prereq(format!("Cannot get current information from node '{}'", node))
                })?;
            if required > 0 && info.vg_free < required {
                return Err(Error::prereq(format!(
                    "Not enough disk space on target node {}. needed {} MiB, available {} MiB",
                    node, required, info.vg_free
                )));
            }
            if *node == primary && self.req.start && info.memory_free < self.req.mem_size {
                return Err(Error::prereq(format!(
                    "Not enough memory on node {} to start the instance: needed {} MiB, available {} MiB",
                    node, self.req.mem_size, info.memory_free
                )));
            }
        }

        if !ctx.rpc.os_get(&primary, &os).await.unwrap_or(false) {
            return Err(Error::prereq(format!(
                "OS '{}' not in supported os list for primary node {}",
                os, primary
            )));
        }

        let bridge = self
            .req
            .bridge
            .clone()
            .unwrap_or_else(|| config.default_bridge.clone());
        let bridges = [bridge.clone()];
        if !ctx.rpc.bridges_exist(&primary, &bridges).await.unwrap_or(false) {
            return Err(Error::prereq(format!(
                "Target bridge '{}' does not exist on destination node '{}'",
                bridge, primary
            )));
        }

        self.plan = Some(Plan {
            template,
            primary,
            secondaries,
            os,
            bridge,
            ip,
            source,
        });
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(plan) = &self.plan else {
            return HooksEnv::default();
        };
        let nic = Nic {
            mac: String::new(),
            bridge: plan.bridge.clone(),
            ip: plan.ip.clone(),
        };
        let status = if self.req.start { "up" } else { "down" };
        let mut env = instance_env(
            &self.req.instance_name,
            &plan.primary,
            &plan.secondaries,
            &plan.os,
            status,
            self.req.mem_size,
            self.req.vcpus,
            &[nic],
        );
        env.set("INSTANCE_DISK_TEMPLATE", plan.template)
            .set("INSTANCE_DISK_SIZE", self.req.disk_size)
            .set("INSTANCE_SWAP_SIZE", self.req.swap_size)
            .set("INSTANCE_ADD_MODE", &self.req.mode);
        if let Source::Import { node, path } = &plan.source {
            env.set("INSTANCE_SRC_NODE", node).set("INSTANCE_SRC_PATH", path);
        }

        let mut nodes = vec![config.master_node.clone(), plan.primary.clone()];
        nodes.extend(plan.secondaries.iter().cloned());
        nodes.dedup();
        env.pre_nodes = nodes.clone();
        env.post_nodes = nodes;
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let plan = checked(&self.plan, self.name())?.clone();
        let name = self.req.instance_name.clone();

        let mut undo = UndoStack::new();
        let mac = ctx.config.generate_mac()?;
        undo.push(UndoAction::ReleaseMac { mac: mac.clone() });
        let nic = Nic {
            mac,
            bridge: plan.bridge.clone(),
            ip: plan.ip.clone(),
        };
        let disks = match generate_disk_template(
            plan.template,
            &name,
            &plan.primary,
            &plan.secondaries,
            self.req.disk_size,
            self.req.swap_size,
            &ctx.config.vg_name(),
            || ctx.config.allocate_port(),
        ) {
            Ok(disks) => disks,
            Err(e) => {
                undo.unwind(ctx.rpc(), &ctx.config).await;
                return Err(e);
            }
        };

        let mut instance = Instance {
            name: name.clone(),
            primary_node: plan.primary.clone(),
            secondary_nodes: plan.secondaries.clone(),
            memory: self.req.mem_size,
            vcpus: self.req.vcpus,
            disk_template: plan.template,
            disks,
            nics: vec![nic],
            status: InstanceStatus::Down,
            os: plan.os.clone(),
        };

        feedback.feedback("* creating instance disks...");
        if let Err(e) = ctx.blockdev.create_disks(&mut instance, &mut undo).await {
            error!("{}", e);
            undo.unwind(ctx.rpc(), &ctx.config).await;
            return Err(Error::exec("Device creation failed, reverting..."));
        }

        feedback.feedback(&format!("adding instance {} to cluster config", name));
        if let Err(e) = ctx.config.add_instance(instance.clone()) {
            undo.unwind(ctx.rpc(), &ctx.config).await;
            return Err(e);
        }
        undo.push(UndoAction::UnregisterInstance { name: name.clone() });

        let disk_abort = if self.req.wait_for_sync {
            !self.sync_ok(ctx, &instance, false).await
        } else if plan.template.has_secondary() {
            // the mirrors need a moment to connect before their state means anything
            tokio::time::sleep(ctx.blockdev.policy().grace_period).await;
            feedback.feedback("* checking mirrors status");
            !self.sync_ok(ctx, &instance, true).await
        } else {
            false
        };
        if disk_abort {
            undo.unwind(ctx.rpc(), &ctx.config).await;
            return Err(Error::exec("There are some degraded disks for this instance"));
        }
        undo.commit();

        feedback.feedback(&format!(
            "creating os for instance {} on node {}",
            name, plan.primary
        ));
        let installed = match &plan.source {
            Source::Install => {
                ctx.rpc
                    .os_add(&plan.primary, &instance, "sda", "sdb")
                    .await
            }
            Source::Import { node, path } => {
                feedback.feedback("* running the instance OS import scripts...");
                ctx.rpc
                    .os_import(&plan.primary, &instance, "sda", "sdb", node, path)
                    .await
            }
        };
        if !installed.unwrap_or_else(|e| {
            error!("{}", e);
            false
        }) {
            return Err(Error::exec(format!(
                "could not add os for instance {} on node {}",
                name, plan.primary
            )));
        }

        if self.req.start {
            info!("starting instance {} on node {}", name, plan.primary);
            feedback.feedback("* starting instance...");
            let started = ctx
                .rpc
                .instance_start(&plan.primary, &instance, None)
                .await
                .unwrap_or(false);
            if !started {
                return Err(Error::exec("Could not start instance"));
            }
            ctx.config.mark_instance_up(&name)?;
        }
        Ok(OpResult::Done)
    }
}

impl CreateInstance {
    async fn sync_ok(&self, ctx: &Context, instance: &Instance, oneshot: bool) -> bool {
        match ctx.blockdev.wait_for_sync(instance, oneshot).await {
            Ok(ok) => ok,
            Err(e) => {
                error!("Could not get the mirror status of {}: {}", instance.name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceKind;
    use crate::controlplane::backends::{RpcCall, SimNodeSpec};
    use crate::controlplane::instance::testutil::Harness;
    use crate::controlplane::opcodes::OpCode;
    use crate::domain::ports::ExportInfo;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_create_remote_mirror_end_to_end() {
        let h = Harness::new();
        let instance = h.create_web1().await;

        assert!(instance.is_up());
        assert_eq!(instance.primary_node, "n1.example.com");
        assert_eq!(instance.secondary_nodes, vec!["n2.example.com"]);
        assert_eq!(instance.disks.len(), 2);
        assert_eq!(instance.nics.len(), 1);
        assert_eq!(instance.nics[0].bridge, "xen-br0");

        for node in ["n1.example.com", "n2.example.com"] {
            assert_eq!(h.fleet.device_count(node, DeviceKind::Replicated), 2);
            assert_eq!(h.fleet.vg_free(node), Some(20000 - 11520));
        }
        assert_eq!(h.fleet.device_count("n1.example.com", DeviceKind::Mirror), 2);
        assert_eq!(h.fleet.device_count("n2.example.com", DeviceKind::Mirror), 0);
        assert!(h.fleet.is_running("n1.example.com", "web1"));
        assert_eq!(h.fleet.call_count("n3.example.com", RpcCall::BlockdevCreate), 0);

        // every disk has a distinct port
        let ports: Vec<u16> = instance
            .disks
            .iter()
            .filter_map(|d| d.children[0].port())
            .collect();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
    }

    #[tokio::test]
    async fn test_create_fails_when_secondary_lacks_space() {
        let h = Harness::with_specs(&[
            ("n1.example.com", SimNodeSpec::default().with_vg_free(20000)),
            ("n2.example.com", SimNodeSpec::default().with_vg_free(10000)),
        ]);
        let result = h
            .run(OpCode::InstanceCreate(Harness::create_request("remote-mirror")))
            .await;

        assert_matches!(result, Err(Error::Prereq(msg)) if msg.contains("n2.example.com"));
        assert_eq!(h.fleet.total_calls(RpcCall::BlockdevCreate), 0);
        assert!(h.config().instance("web1").is_none());
    }

    #[tokio::test]
    async fn test_create_plain_and_diskless() {
        let h = Harness::new();
        let mut req = Harness::create_request("plain");
        req.start = false;
        h.run(OpCode::InstanceCreate(req)).await.unwrap();
        let web1 = h.instance("web1");
        assert!(!web1.is_up());
        assert!(web1.secondary_nodes.is_empty());
        assert_eq!(h.fleet.vg_free("n1.example.com"), Some(20000 - 11264));
        assert_eq!(h.fleet.total_calls(RpcCall::InstanceStart), 0);

        let mut req = Harness::create_request("diskless");
        req.instance_name = "dns1".into();
        h.run(OpCode::InstanceCreate(req)).await.unwrap();
        assert!(h.instance("dns1").disks.is_empty());
        assert!(h.instance("dns1").is_up());
    }

    #[tokio::test]
    async fn test_create_prereq_validation() {
        let h = Harness::new();

        let mut req = Harness::create_request("remote-mirror");
        req.secondary_node = None;
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("remote-mirror");
        req.secondary_node = Some("n1".into());
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("raid5");
        req.secondary_node = None;
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("plain");
        req.os_type = Some("plan9".into());
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(msg)) if msg.contains("plan9"));

        let mut req = Harness::create_request("plain");
        req.bridge = Some("br-missing".into());
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("plain");
        req.ip = Some("10.0.0.300".into());
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("plain");
        req.mode = "clone".into();
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));

        let mut req = Harness::create_request("plain");
        req.mem_size = 8192;
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(msg)) if msg.contains("memory"));

        assert_eq!(h.fleet.total_calls(RpcCall::BlockdevCreate), 0);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_and_ip() {
        let h = Harness::new();
        let mut req = Harness::create_request("plain");
        req.ip = Some("192.0.2.80".into());
        h.run(OpCode::InstanceCreate(req.clone())).await.unwrap();

        assert_matches!(
            h.run(OpCode::InstanceCreate(req.clone())).await,
            Err(Error::Prereq(msg)) if msg.contains("already in the cluster")
        );

        req.instance_name = "web2".into();
        assert_matches!(
            h.run(OpCode::InstanceCreate(req)).await,
            Err(Error::Prereq(msg)) if msg.contains("already in use")
        );
    }

    #[tokio::test]
    async fn test_create_device_failure_reverts() {
        let h = Harness::new();
        h.fleet.fail("n1.example.com", RpcCall::BlockdevCreate);

        let result = h
            .run(OpCode::InstanceCreate(Harness::create_request("remote-mirror")))
            .await;
        assert_matches!(result, Err(Error::Exec(_)));
        assert!(h.config().instance("web1").is_none());
        // the secondary side was created first and has been removed again
        assert!(h.fleet.call_count("n2.example.com", RpcCall::BlockdevCreate) > 0);
        assert_eq!(h.fleet.vg_free("n2.example.com"), Some(20000));
        assert_eq!(h.fleet.device_count("n2.example.com", DeviceKind::Replicated), 0);
        assert_eq!(h.config().reserved_mac_count(), 0);

        // the MAC handed to the failed attempt is reused
        h.fleet.heal("n1.example.com", RpcCall::BlockdevCreate);
        h.run(OpCode::InstanceCreate(Harness::create_request("remote-mirror")))
            .await
            .unwrap();
        assert_eq!(h.instance("web1").nics[0].mac, "aa:00:00:00:00:01");
        assert_eq!(h.config().reserved_mac_count(), 0);
    }

    #[tokio::test]
    async fn test_create_degraded_sync_unregisters() {
        let h = Harness::new();
        h.fleet.fail("n1.example.com", RpcCall::BlockdevMirrorStatus);

        let result = h
            .run(OpCode::InstanceCreate(Harness::create_request("remote-mirror")))
            .await;
        assert_matches!(result, Err(Error::Exec(_)));
        assert!(h.config().instance("web1").is_none());
        assert_eq!(h.fleet.vg_free("n1.example.com"), Some(20000));
        assert_eq!(h.fleet.vg_free("n2.example.com"), Some(20000));
        assert_eq!(h.config().reserved_mac_count(), 0);
    }

    #[tokio::test]
    async fn test_create_os_failure_keeps_instance_down() {
        let h = Harness::new();
        h.fleet.fail("n1.example.com", RpcCall::OsAdd);

        let result = h
            .run(OpCode::InstanceCreate(Harness::create_request("plain")))
            .await;
        assert_matches!(result, Err(Error::Exec(msg)) if msg.contains("could not add os"));
        assert!(!h.instance("web1").is_up());
    }

    #[tokio::test]
    async fn test_import_takes_os_from_export() {
        let h = Harness::new();
        h.fleet.add_export(
            "n3.example.com",
            "/srv/export/web0",
            ExportInfo {
                os: "debian-etch".into(),
                instance: "web0".into(),
            },
        );
        let mut req = Harness::create_request("plain");
        req.mode = "import".into();
        req.os_type = None;
        req.src_node = Some("n3".into());
        req.src_path = Some("/srv/export/web0".into());
        h.run(OpCode::InstanceCreate(req.clone())).await.unwrap();

        assert_eq!(h.instance("web1").os, "debian-etch");
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::OsImport), 1);
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::OsAdd), 0);

        req.instance_name = "web2".into();
        req.src_path = Some("/srv/export/none".into());
        assert_matches!(h.run(OpCode::InstanceCreate(req)).await, Err(Error::Prereq(_)));
    }
}
