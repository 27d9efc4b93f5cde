//! Coordinator Client (C5): a typed wrapper over the coordination-service
//! backend exposing the fixed paths and locking/watch semantics §4.5 needs.

mod backend;

pub use backend::{CoordinatorBackend, InMemoryBackend};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::registration::{self, Registration};

const ROOT: &str = "/ezfrontend";

fn config_path(node: &str) -> String {
    format!("{ROOT}/config/{node}")
}

fn ssl_path(server_name: &str) -> String {
    format!("{ROOT}/ssl/{server_name}")
}

fn watch_path() -> String {
    format!("{ROOT}/watch")
}

/// Typed wrapper over a `CoordinatorBackend`. Holds the one coordination
/// lock used to serialize writer operations (§5: "the only cross-process
/// mutual-exclusion primitive").
pub struct CoordinatorClient {
    backend: Arc<dyn CoordinatorBackend>,
    lock: Mutex<()>,
}

impl CoordinatorClient {
    #[must_use]
    pub fn new(backend: Arc<dyn CoordinatorBackend>) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    fn now_millis() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis()
    }

    /// Bumps `…/watch` to the current time. Must be called while holding the
    /// coordinator lock, immediately after the primary write it accompanies.
    async fn bump_watch(&self) {
        self.backend
            .set(&watch_path(), Self::now_millis().to_string().into_bytes())
            .await;
    }

    /// The current value of `…/watch`, used by the Watcher (C9) to detect
    /// the first invocation / reconnection case.
    pub async fn watch_value(&self) -> Option<Vec<u8>> {
        self.backend.get(&watch_path()).await
    }

    /// Writes a new registration, bumping the watch under the coordinator
    /// lock. Returns `false` if a node with the same name already exists
    /// (the caller is expected to have already checked for prefix/path
    /// conflicts at the RPC layer).
    pub async fn add_registration(&self, r: &Registration) -> bool {
        let _guard = self.lock.lock().await;
        let created = self.backend.create(&config_path(&r.node_name()), registration::encode(r)).await;
        if created {
            self.bump_watch().await;
        }
        created
    }

    /// Deletes a registration's node, bumping the watch if it existed.
    pub async fn remove_registration(&self, node_name: &str) -> bool {
        let _guard = self.lock.lock().await;
        let existed = self.backend.delete(&config_path(node_name)).await;
        if existed {
            self.bump_watch().await;
        }
        existed
    }

    /// Deletes every `…/config` child whose node name starts with the given
    /// prefix (used by `removeReverseProxiedPath`, §4.10). Bumps the watch
    /// if anything was deleted.
    pub async fn remove_registrations_with_node_prefix(&self, node_prefix: &str) -> usize {
        let _guard = self.lock.lock().await;
        let children = self.backend.get_children(&format!("{ROOT}/config")).await;
        let mut removed = 0usize;
        for child in children {
            if child.starts_with(node_prefix) && self.backend.delete(&config_path(&child)).await {
                removed += 1;
            }
        }
        if removed > 0 {
            self.bump_watch().await;
        }
        removed
    }

    /// Fetches and decodes every current registration.
    pub async fn all_registrations(&self) -> Vec<Registration> {
        let children = self.backend.get_children(&format!("{ROOT}/config")).await;
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            if let Some(bytes) = self.backend.get(&config_path(&child)).await {
                if let Ok(r) = registration::decode(&bytes) {
                    out.push(r);
                }
            }
        }
        out
    }

    /// Deletes a registration by node name without taking the watch bump
    /// (used from the Configurer when auto-pruning an unresolvable upstream,
    /// which bumps the watch itself as part of its own lock scope).
    pub async fn remove_registration_raw(&self, node_name: &str) -> bool {
        let _guard = self.lock.lock().await;
        let existed = self.backend.delete(&config_path(node_name)).await;
        if existed {
            self.bump_watch().await;
        }
        existed
    }

    /// Names of servers with a published cert (`…/ssl` children).
    pub async fn ssl_server_names(&self) -> Vec<String> {
        self.backend.get_children(&format!("{ROOT}/ssl")).await
    }

    pub async fn ssl_node_exists(&self, server_name: &str) -> bool {
        self.backend.exists(&ssl_path(server_name)).await
    }

    /// Ensures `…/ssl/<serverName>` exists, bumping the watch.
    pub async fn ensure_ssl_node(&self, server_name: &str) {
        let _guard = self.lock.lock().await;
        self.backend.ensure_path(&ssl_path(server_name)).await;
        self.bump_watch().await;
    }

    /// Deletes `…/ssl/<serverName>`, bumping the watch if it existed.
    pub async fn remove_ssl_node(&self, server_name: &str) -> bool {
        let _guard = self.lock.lock().await;
        let existed = self.backend.delete(&ssl_path(server_name)).await;
        if existed {
            self.bump_watch().await;
        }
        existed
    }

    /// Runs `f` with the coordinator lock held, without an implicit watch
    /// bump; `f` is responsible for calling `bump_watch_locked` if needed.
    /// Used by the RPC server (C10) to compose multi-step mutations
    /// (e.g. delete registration + conditionally remove ssl node) under a
    /// single lock acquisition while still bumping the watch exactly once.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(LockedCoordinator<'_>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        f(LockedCoordinator { client: self }).await
    }
}

/// A view of the `CoordinatorClient` obtained while its lock is held,
/// exposing raw backend access plus an explicit watch bump, for composing
/// multi-step mutations atomically.
pub struct LockedCoordinator<'a> {
    client: &'a CoordinatorClient,
}

impl LockedCoordinator<'_> {
    pub async fn delete_registration(&self, node_name: &str) -> bool {
        self.client.backend.delete(&config_path(node_name)).await
    }

    pub async fn delete_ssl_node(&self, server_name: &str) -> bool {
        self.client.backend.delete(&ssl_path(server_name)).await
    }

    pub async fn registrations_sharing_server_name(&self, server_name: &str) -> Vec<Registration> {
        self.client
            .all_registrations()
            .await
            .into_iter()
            .filter(|r| r.server_name() == server_name)
            .collect()
    }

    pub async fn bump_watch(&self) {
        self.client.bump_watch().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::{AuthOperation, ContentServiceType};

    fn sample_registration(prefix: &str) -> Registration {
        Registration {
            user_facing_url_prefix: prefix.into(),
            upstream_host_and_port: "10.0.0.1:8443".into(),
            upstream_path: "/bar".into(),
            timeout: 30,
            timeout_tries: 2,
            upload_file_size: 0,
            sticky: false,
            disable_chunked_transfer_encoding: false,
            auth_operations: [AuthOperation::UserInfo].into_iter().collect(),
            content_service_type: ContentServiceType::Proxy,
            validate_upstream_connection: true,
            app_name: "app".into(),
            unknown_fields: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_registration_bumps_watch() {
        let client = CoordinatorClient::new(Arc::new(InMemoryBackend::new()));
        assert!(client.watch_value().await.is_none());
        let r = sample_registration("app.example.com/foo");
        assert!(client.add_registration(&r).await);
        assert!(client.watch_value().await.is_some());
        assert_eq!(client.all_registrations().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_registrations_with_node_prefix_removes_matching_only() {
        let client = CoordinatorClient::new(Arc::new(InMemoryBackend::new()));
        let a = sample_registration("app.example.com/foo");
        let b = sample_registration("other.example.com/foo");
        client.add_registration(&a).await;
        client.add_registration(&b).await;

        let node_prefix = crate::b62::encode("app.example.com/foo");
        let removed = client.remove_registrations_with_node_prefix(&node_prefix).await;
        assert_eq!(removed, 1);
        assert_eq!(client.all_registrations().await.len(), 1);
    }
}
