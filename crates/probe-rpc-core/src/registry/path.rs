//! Hierarchical-path registry backend.
//!
//! Each instance becomes one dynamic (process-scoped) node at
//! `/<base_path>/<interface>/<id>` whose data is a JSON [`PathNode`].

use super::{RegistryBackend, ServiceInstance};
use crate::config::RegistryBackendKind;
use crate::error::{Result, RpcError};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// URI template stored with every node.
pub const URI_SPEC: &str = "{scheme}://{address}:{port}";

/// Lifetime of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives the process that created it.
    Persistent,
    /// Disappears once the owning process is gone.
    Ephemeral,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Persistent => "persistent",
            NodeMode::Ephemeral => "ephemeral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "persistent" => Some(NodeMode::Persistent),
            "ephemeral" => Some(NodeMode::Ephemeral),
            _ => None,
        }
    }
}

/// Minimal node primitives the path backend needs from its store.
pub trait NodeStore: Send + Sync {
    /// Check that the store can be reached.
    fn ping(&self) -> Result<()>;

    /// Create or overwrite the node at `path`.
    fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()>;

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Names (last path segment) of the direct children of `path`.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Returns whether a node was removed.
    fn delete(&self, path: &str) -> Result<bool>;
}

/// Split `/a/b/c` into (`/a/b`, `c`).
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

/// In-process node store. Nodes live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<String, (Vec<u8>, NodeMode)>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for MemoryNodeStore {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn create(&self, path: &str, data: &[u8], mode: NodeMode) -> Result<()> {
        self.nodes
            .write()
            .insert(path.to_string(), (data.to_vec(), mode));
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.nodes.read().get(path).map(|(data, _)| data.clone()))
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let nodes = self.nodes.read();
        Ok(nodes
            .keys()
            .filter_map(|key| {
                let (parent, name) = split_parent(key);
                (parent == path).then(|| name.to_string())
            })
            .collect())
    }

    fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.nodes.write().remove(path).is_some())
    }
}

/// Location details nested inside a [`PathNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDetail {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub interface_name: String,
}

/// Data stored at each instance node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathNode {
    pub name: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "registrationTimeUTC")]
    pub registration_time_utc: i64,
    pub service_type: String,
    pub uri_spec: String,
    /// Expanded `uri_spec`.
    pub uri: String,
    pub payload: InstanceDetail,
}

impl PathNode {
    fn from_instance(instance: &ServiceInstance, scheme: &str) -> Self {
        let registered = DateTime::parse_from_rfc3339(&instance.registered_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Self {
            name: instance.interface_name.clone(),
            id: instance.id.clone(),
            address: instance.address.clone(),
            port: instance.port,
            registration_time_utc: registered.timestamp_millis(),
            service_type: "DYNAMIC".to_string(),
            uri_spec: URI_SPEC.to_string(),
            uri: instance.uri(URI_SPEC, scheme),
            payload: InstanceDetail {
                id: instance.id.clone(),
                address: instance.address.clone(),
                port: instance.port,
                interface_name: instance.interface_name.clone(),
            },
        }
    }

    fn into_instance(self) -> ServiceInstance {
        let registered_at = Utc
            .timestamp_millis_opt(self.registration_time_utc)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339();
        ServiceInstance {
            id: self.payload.id,
            address: self.payload.address,
            port: self.payload.port,
            interface_name: self.payload.interface_name,
            registry_backend: RegistryBackendKind::Path,
            registered_at,
        }
    }
}

/// Path-style registry over any [`NodeStore`].
pub struct PathRegistry {
    store: Arc<dyn NodeStore>,
    base_path: String,
    scheme: String,
}

impl PathRegistry {
    pub fn new(store: Arc<dyn NodeStore>, base_path: &str, scheme: &str) -> Self {
        let trimmed = base_path.trim_matches('/');
        let base_path = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        };
        Self {
            store,
            base_path,
            scheme: scheme.to_string(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `/<base_path>/<interface>`
    pub fn service_path(&self, interface_name: &str) -> String {
        format!("{}/{}", self.base_path, interface_name)
    }

    /// `/<base_path>/<interface>/<id>`
    pub fn instance_path(&self, instance: &ServiceInstance) -> String {
        format!("{}/{}", self.service_path(&instance.interface_name), instance.id)
    }

    /// The store this registry writes to.
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub(super) fn ping(&self) -> Result<()> {
        self.store.ping()
    }
}

impl PathRegistry {
    /// Run store calls on the blocking pool; the SQLite store does file I/O.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn NodeStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| RpcError::Io {
                message: format!("registry store task failed: {}", e),
                source: None,
            })?
    }
}

#[async_trait::async_trait]
impl RegistryBackend for PathRegistry {
    fn kind(&self) -> RegistryBackendKind {
        RegistryBackendKind::Path
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let path = self.instance_path(instance);
        let node = PathNode::from_instance(instance, &self.scheme);
        let data = serde_json::to_vec(&node)?;

        let node_path = path.clone();
        self.with_store(move |store| store.create(&node_path, &data, NodeMode::Ephemeral))
            .await
            .map_err(|e| RpcError::RegistrationFailed {
                id: instance.id.clone(),
                message: e.to_string(),
            })?;

        debug!("Created registry node {}", path);
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        let path = self.instance_path(instance);
        let node_path = path.clone();
        if self.with_store(move |store| store.delete(&node_path)).await? {
            debug!("Deleted registry node {}", path);
        }
        Ok(())
    }

    async fn instances(&self, interface_name: &str) -> Result<Vec<ServiceInstance>> {
        let service_path = self.service_path(interface_name);

        self.with_store(move |store| {
            let mut found = Vec::new();
            for child in store.children(&service_path)? {
                let path = format!("{}/{}", service_path, child);
                let Some(data) = store.read(&path)? else {
                    continue;
                };
                match serde_json::from_slice::<PathNode>(&data) {
                    Ok(node) => found.push(node.into_instance()),
                    Err(e) => warn!("Skipping unreadable registry node {}: {}", path, e),
                }
            }
            Ok(found)
        })
        .await
    }
}
