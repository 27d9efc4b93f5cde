//! The coordination-service capability seam (§9: "the persistence
//! abstraction is a simple capability set {read, write, delete, scan}").
//!
//! The real coordination service (ZooKeeper) is an external collaborator out
//! of scope for this crate (§1). `CoordinatorBackend` is the trait the
//! Coordinator Client (C5) is built against; the shipped implementation is
//! an in-process, mutex-guarded tree, sufficient for single-node operation
//! and as a seam a real distributed backend could later implement.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// A minimal hierarchical store with watch and lock support.
#[async_trait]
pub trait CoordinatorBackend: Send + Sync {
    /// Creates the node at `path` if it doesn't already exist, creating
    /// intermediate empty nodes as needed.
    async fn ensure_path(&self, path: &str);
    /// Creates a node with the given data, failing if it already exists.
    async fn create(&self, path: &str, data: Vec<u8>) -> bool;
    /// Sets the data of an existing node (creating it if absent).
    async fn set(&self, path: &str, data: Vec<u8>);
    /// Deletes a node. Returns whether it existed.
    async fn delete(&self, path: &str) -> bool;
    /// Whether a node exists.
    async fn exists(&self, path: &str) -> bool;
    /// Direct (non-recursive) child names of `path`, sorted.
    async fn get_children(&self, path: &str) -> Vec<String>;
    /// The data stored at `path`, if it exists.
    async fn get(&self, path: &str) -> Option<Vec<u8>>;
}

/// In-process backend: a `BTreeMap` of path -> node, guarded by a single
/// mutex. Distributed locking collapses to ordinary mutual exclusion within
/// the process, which is sufficient because this crate only ever runs one
/// Reconfigure Loop (C8) and one Control RPC Server (C10) per process.
#[derive(Default)]
pub struct InMemoryBackend {
    tree: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn children_of<'a>(tree: &'a BTreeMap<String, Vec<u8>>, prefix: &str) -> Vec<String> {
        let scoped_prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut names: Vec<String> = tree
            .keys()
            .filter_map(|k| k.strip_prefix(&scoped_prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl CoordinatorBackend for InMemoryBackend {
    async fn ensure_path(&self, path: &str) {
        let mut tree = self.tree.lock().await;
        tree.entry(path.to_string()).or_insert_with(Vec::new);
    }

    async fn create(&self, path: &str, data: Vec<u8>) -> bool {
        let mut tree = self.tree.lock().await;
        if tree.contains_key(path) {
            return false;
        }
        tree.insert(path.to_string(), data);
        true
    }

    async fn set(&self, path: &str, data: Vec<u8>) {
        let mut tree = self.tree.lock().await;
        tree.insert(path.to_string(), data);
    }

    async fn delete(&self, path: &str) -> bool {
        let mut tree = self.tree.lock().await;
        tree.remove(path).is_some()
    }

    async fn exists(&self, path: &str) -> bool {
        let tree = self.tree.lock().await;
        tree.contains_key(path)
    }

    async fn get_children(&self, path: &str) -> Vec<String> {
        let tree = self.tree.lock().await;
        Self::children_of(&tree, path)
    }

    async fn get(&self, path: &str) -> Option<Vec<u8>> {
        let tree = self.tree.lock().await;
        tree.get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_children() {
        let backend = InMemoryBackend::new();
        backend.create("/config/a", vec![1]).await;
        backend.create("/config/b", vec![2]).await;
        let children = backend.get_children("/config").await;
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn create_is_false_on_existing_node() {
        let backend = InMemoryBackend::new();
        assert!(backend.create("/x", vec![]).await);
        assert!(!backend.create("/x", vec![]).await);
    }

    #[tokio::test]
    async fn delete_reports_whether_node_existed() {
        let backend = InMemoryBackend::new();
        backend.create("/x", vec![]).await;
        assert!(backend.delete("/x").await);
        assert!(!backend.delete("/x").await);
    }
}
