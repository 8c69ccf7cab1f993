//! Lock Manager
//!
//! Per-instance and per-node mutual exclusion around one operation's
//! CheckPrereq + Exec. Locks are always taken in sorted key order, so two
//! operations sharing objects cannot deadlock.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Objects an operation needs exclusive access to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScope {
    pub instances: BTreeSet<String>,
    pub nodes: BTreeSet<String>,
}

impl LockScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance(mut self, name: impl Into<String>) -> Self {
        self.instances.insert(name.into());
        self
    }

    pub fn node(mut self, name: impl Into<String>) -> Self {
        self.nodes.insert(name.into());
        self
    }

    pub fn nodes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.nodes.is_empty()
    }

    /// Lock keys in acquisition order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .instances
            .iter()
            .map(|i| format!("instance/{}", i))
            .chain(self.nodes.iter().map(|n| format!("node/{}", n)))
            .collect();
        keys.sort();
        keys
    }
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// Held locks; released on drop
///
/// Dropping the last guard interested in a key also forgets the key, so
/// the table only holds objects that are locked or waited for.
#[derive(Debug)]
pub struct LockGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl LockGuard {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // each held guard owns a reference to its mutex
        self.guards.clear();
        for key in &self.keys {
            self.table
                .remove_if(key.as_str(), |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Registry of named async mutexes
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Arc<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every lock of the scope
    pub async fn acquire(&self, scope: &LockScope) -> LockGuard {
        let keys = scope.keys();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        debug!("Acquired locks {:?}", keys);
        LockGuard {
            keys,
            guards,
            table: self.locks.clone(),
        }
    }

    /// Whether a key is currently held by someone
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of keys currently held or waited for
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scope_keys_sorted() {
        let scope = LockScope::new()
            .node("node2")
            .instance("web1")
            .nodes(["node1", "node2"]);
        assert_eq!(
            scope.keys(),
            vec!["instance/web1", "node/node1", "node/node2"]
        );
    }

    #[tokio::test]
    async fn test_locks_release_on_drop() {
        let manager = LockManager::new();
        let scope = LockScope::new().instance("web1");
        let guard = manager.acquire(&scope).await;
        assert!(manager.is_locked("instance/web1"));
        drop(guard);
        assert!(!manager.is_locked("instance/web1"));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_scopes_serialize() {
        let manager = Arc::new(LockManager::new());
        let guard = manager
            .acquire(&LockScope::new().instance("web1").node("node1"))
            .await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _guard = manager.acquire(&LockScope::new().node("node1")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_waited_for_key_is_kept() {
        let manager = Arc::new(LockManager::new());
        let guard = manager.acquire(&LockScope::new().node("node1")).await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let guard = manager.acquire(&LockScope::new().node("node1")).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the waiter still references node1, so the entry survives
        drop(guard);
        assert_eq!(manager.len(), 1);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.is_empty());
    }
}
