//! Flat key/tag registry backend.
//!
//! Each instance is one catalog entry keyed by its id, named after the
//! interface and tagged with the interface name so it can be filtered later.

use super::{RegistryBackend, ServiceInstance};
use crate::config::RegistryBackendKind;
use crate::error::{Result, RpcError};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One entry in a flat catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
}

impl CatalogEntry {
    fn from_instance(instance: &ServiceInstance) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.interface_name.clone(),
            address: instance.address.clone(),
            port: instance.port,
            tags: vec![instance.interface_name.clone()],
        }
    }

    fn into_instance(self, interface_name: &str) -> ServiceInstance {
        ServiceInstance {
            id: self.id,
            address: self.address,
            port: self.port,
            interface_name: interface_name.to_string(),
            registry_backend: RegistryBackendKind::Flat,
            registered_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Minimal catalog primitives the flat backend needs.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Create or replace the entry with `entry.id`.
    async fn register(&self, entry: &CatalogEntry) -> Result<()>;

    async fn deregister(&self, id: &str) -> Result<()>;

    /// Entries carrying `tag`.
    async fn tagged(&self, tag: &str) -> Result<Vec<CatalogEntry>>;
}

/// In-process catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn register(&self, entry: &CatalogEntry) -> Result<()> {
        self.entries.write().insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.entries.write().remove(id);
        Ok(())
    }

    async fn tagged(&self, tag: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .cloned()
            .collect())
    }
}

/// Flat registry over any [`Catalog`].
pub struct FlatRegistry {
    catalog: Arc<dyn Catalog>,
}

impl FlatRegistry {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub(super) async fn ping(&self) -> Result<()> {
        self.catalog.ping().await
    }
}

#[async_trait::async_trait]
impl RegistryBackend for FlatRegistry {
    fn kind(&self) -> RegistryBackendKind {
        RegistryBackendKind::Flat
    }

    async fn register(&self, instance: &ServiceInstance) -> Result<()> {
        let entry = CatalogEntry::from_instance(instance);
        self.catalog
            .register(&entry)
            .await
            .map_err(|e| RpcError::RegistrationFailed {
                id: instance.id.clone(),
                message: e.to_string(),
            })?;

        debug!("Registered catalog entry {} tagged {:?}", entry.id, entry.tags);
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<()> {
        self.catalog.deregister(&instance.id).await
    }

    async fn instances(&self, interface_name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .catalog
            .tagged(interface_name)
            .await?
            .into_iter()
            .map(|entry| entry.into_instance(interface_name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_tags_entry_with_interface() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = FlatRegistry::new(catalog.clone());
        let instance = ServiceInstance::new("127.0.0.1", 9000, "Greeter", RegistryBackendKind::Flat);

        registry.register(&instance).await.unwrap();

        let entries = catalog.tagged("Greeter").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "127.0.0.1:9000:Greeter");
        assert_eq!(entries[0].name, "Greeter");
        assert_eq!(entries[0].tags, vec!["Greeter".to_string()]);
    }

    struct RejectingCatalog;

    #[async_trait::async_trait]
    impl Catalog for RejectingCatalog {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn register(&self, _entry: &CatalogEntry) -> Result<()> {
            Err(RpcError::Http {
                message: "403 Forbidden".into(),
                status_code: Some(403),
            })
        }
        async fn deregister(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn tagged(&self, _tag: &str) -> Result<Vec<CatalogEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_rejected_write_is_registration_failed() {
        let registry = FlatRegistry::new(Arc::new(RejectingCatalog));
        let instance = ServiceInstance::new("127.0.0.1", 9000, "Greeter", RegistryBackendKind::Flat);

        match registry.register(&instance).await.unwrap_err() {
            RpcError::RegistrationFailed { id, message } => {
                assert_eq!(id, "127.0.0.1:9000:Greeter");
                assert!(message.contains("403"));
            }
            other => panic!("Expected RegistrationFailed, got: {:?}", other),
        }
    }
}
