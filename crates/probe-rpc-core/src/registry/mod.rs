//! Service registry: where a server publishes the location of each interface
//! it exposes.
//!
//! Two interchangeable backends are supported, selected by
//! [`RegistryConfig::backend`](crate::config::RegistryConfig):
//! - **Path** ([`PathRegistry`]): one node per instance at
//!   `/<base_path>/<interface>/<id>`, Zookeeper-style, stored in a [`NodeStore`]
//! - **Flat** ([`FlatRegistry`]): one entry per instance keyed by id and tagged
//!   with the interface name, Consul-style, stored in a [`Catalog`]
//!
//! Callers only see [`Registry`], which publishes an instance under an
//! interface name regardless of the backend behind it.

pub mod consul;
pub mod flat;
pub mod instance;
pub mod node_store;
pub mod path;

pub use consul::ConsulCatalog;
pub use flat::{Catalog, CatalogEntry, FlatRegistry, MemoryCatalog};
pub use instance::ServiceInstance;
pub use node_store::SqliteNodeStore;
pub use path::{MemoryNodeStore, NodeMode, NodeStore, PathRegistry};

use crate::config::{RegistryBackendKind, RegistryConfig};
use crate::error::{Result, RpcError};
use std::sync::Arc;
use tracing::info;

/// Operations every registry backend provides.
#[async_trait::async_trait]
pub trait RegistryBackend: Send + Sync {
    fn kind(&self) -> RegistryBackendKind;

    /// Publish one instance. Registering the same id twice is a no-op update.
    async fn register(&self, instance: &ServiceInstance) -> Result<()>;

    /// Remove a published instance. Missing entries are not an error.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<()>;

    /// Instances currently published under an interface name.
    async fn instances(&self, interface_name: &str) -> Result<Vec<ServiceInstance>>;
}

/// The registry handle a server owns for its whole lifetime.
pub enum Registry {
    Path(PathRegistry),
    Flat(FlatRegistry),
}

impl Registry {
    /// Connect to the backend selected by `config`.
    ///
    /// Fails with `RegistryUnreachable` when the backend cannot be contacted.
    pub async fn configure(config: &RegistryConfig) -> Result<Self> {
        let registry = match config.backend {
            RegistryBackendKind::Path => {
                let store: Arc<dyn NodeStore> = if config.is_memory() {
                    Arc::new(MemoryNodeStore::new())
                } else {
                    let db_path = node_store::db_path_from_address(&config.address);
                    let store = SqliteNodeStore::open_at(&db_path).map_err(|e| {
                        RpcError::RegistryUnreachable {
                            address: config.address.clone(),
                            message: e.to_string(),
                        }
                    })?;
                    Arc::new(store)
                };
                Registry::Path(PathRegistry::new(store, &config.base_path, &config.scheme))
            }
            RegistryBackendKind::Flat => {
                let catalog: Arc<dyn Catalog> = if config.is_memory() {
                    Arc::new(MemoryCatalog::new())
                } else {
                    Arc::new(ConsulCatalog::new(&config.address, config.timeout()).map_err(
                        |e| RpcError::RegistryUnreachable {
                            address: config.address.clone(),
                            message: e.to_string(),
                        },
                    )?)
                };
                Registry::Flat(FlatRegistry::new(catalog))
            }
        };

        registry
            .ping()
            .await
            .map_err(|e| RpcError::RegistryUnreachable {
                address: config.address.clone(),
                message: e.to_string(),
            })?;

        info!(
            "Registry configured: backend={} address={}",
            config.backend, config.address
        );
        Ok(registry)
    }

    async fn ping(&self) -> Result<()> {
        match self {
            Registry::Path(r) => r.ping(),
            Registry::Flat(r) => r.ping().await,
        }
    }

    fn backend(&self) -> &dyn RegistryBackend {
        match self {
            Registry::Path(r) => r,
            Registry::Flat(r) => r,
        }
    }

    pub fn kind(&self) -> RegistryBackendKind {
        self.backend().kind()
    }

    pub async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        self.backend().register(instance).await
    }

    pub async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        self.backend().deregister(instance).await
    }

    pub async fn instances(&self, interface_name: &str) -> Result<Vec<ServiceInstance>> {
        self.backend().instances(interface_name).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Registry").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(backend: RegistryBackendKind) -> RegistryConfig {
        RegistryConfig {
            backend,
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_configure_memory_backends() {
        for kind in [RegistryBackendKind::Path, RegistryBackendKind::Flat] {
            let registry = Registry::configure(&memory_config(kind)).await.unwrap();
            assert_eq!(registry.kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_both_backends() {
        for kind in [RegistryBackendKind::Path, RegistryBackendKind::Flat] {
            let registry = Registry::configure(&memory_config(kind)).await.unwrap();
            let instance = ServiceInstance::new("127.0.0.1", 9000, "Greeter", kind);

            registry.register(&instance).await.unwrap();
            registry.register(&instance).await.unwrap();

            let found = registry.instances("Greeter").await.unwrap();
            assert_eq!(found.len(), 1, "backend {}", kind);
            assert_eq!(found[0].id, "127.0.0.1:9000:Greeter");
            assert_eq!(found[0].registry_backend, kind);
        }
    }

    #[tokio::test]
    async fn test_deregister_removes_instance() {
        for kind in [RegistryBackendKind::Path, RegistryBackendKind::Flat] {
            let registry = Registry::configure(&memory_config(kind)).await.unwrap();
            let instance = ServiceInstance::new("127.0.0.1", 9000, "Greeter", kind);

            registry.register(&instance).await.unwrap();
            registry.deregister(&instance).await.unwrap();
            assert!(registry.instances("Greeter").await.unwrap().is_empty());

            // Second removal is harmless
            registry.deregister(&instance).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_configure_unreachable_consul() {
        let config = RegistryConfig {
            backend: RegistryBackendKind::Flat,
            address: "http://127.0.0.1:1".to_string(),
            timeout_ms: 500,
            ..RegistryConfig::default()
        };

        match Registry::configure(&config).await.unwrap_err() {
            RpcError::RegistryUnreachable { address, .. } => {
                assert_eq!(address, "http://127.0.0.1:1");
            }
            other => panic!("Expected RegistryUnreachable, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_configure_sqlite_path_backend() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db = temp_dir.path().join("nested").join("registry.db");
        let config = RegistryConfig {
            backend: RegistryBackendKind::Path,
            address: format!("sqlite://{}", db.display()),
            ..RegistryConfig::default()
        };

        let registry = Registry::configure(&config).await.unwrap();
        assert_eq!(registry.kind(), RegistryBackendKind::Path);
        assert!(db.exists());
    }
}
