//! Operation Hooks
//!
//! Pre- and post-execution hooks receive the environment an operation
//! builds for itself. Hooks are advisory: their failures are logged and
//! never change the outcome of the operation.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// When a hook runs relative to Exec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Pre => write!(f, "pre"),
            HookPhase::Post => write!(f, "post"),
        }
    }
}

/// Hook environment of one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksEnv {
    /// Variables exported to hooks
    pub env: BTreeMap<String, String>,
    /// Nodes running the pre hooks
    pub pre_nodes: Vec<String>,
    /// Nodes running the post hooks
    pub post_nodes: Vec<String>,
}

impl HooksEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn nodes_for(&self, phase: HookPhase) -> &[String] {
        match phase {
            HookPhase::Pre => &self.pre_nodes,
            HookPhase::Post => &self.post_nodes,
        }
    }
}

/// Runs hook scripts for an operation
#[async_trait]
pub trait HooksRunner: Send + Sync {
    async fn run(&self, phase: HookPhase, hooks_path: &str, env: &HooksEnv) -> Result<()>;
}

pub type HooksRunnerRef = Arc<dyn HooksRunner>;

/// Runs nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl HooksRunner for NoopHooks {
    async fn run(&self, _phase: HookPhase, _hooks_path: &str, _env: &HooksEnv) -> Result<()> {
        Ok(())
    }
}

/// Records every invocation
#[derive(Debug, Default)]
pub struct RecordingHooks {
    runs: Mutex<Vec<(HookPhase, String, HooksEnv)>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<(HookPhase, String, HooksEnv)> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl HooksRunner for RecordingHooks {
    async fn run(&self, phase: HookPhase, hooks_path: &str, env: &HooksEnv) -> Result<()> {
        self.runs
            .lock()
            .push((phase, hooks_path.to_string(), env.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_hooks() {
        let hooks = RecordingHooks::new();
        let mut env = HooksEnv::new();
        env.set("INSTANCE_NAME", "web1").set("INSTANCE_MEMORY", 512);
        env.pre_nodes = vec!["node1".into()];

        hooks.run(HookPhase::Pre, "instance-start", &env).await.unwrap();
        let runs = hooks.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, HookPhase::Pre);
        assert_eq!(runs[0].2.get("INSTANCE_MEMORY"), Some("512"));
        assert_eq!(runs[0].2.nodes_for(HookPhase::Pre), ["node1".to_string()]);
    }
}
