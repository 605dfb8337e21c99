//! Consul agent adapter for the flat registry.
//!
//! Talks to the local agent's HTTP API:
//! - `GET  /v1/status/leader` reachability check
//! - `PUT  /v1/agent/service/register`
//! - `PUT  /v1/agent/service/deregister/{id}`
//! - `GET  /v1/agent/services`

use super::flat::{Catalog, CatalogEntry};
use crate::error::{Result, RpcError};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Service definition as the agent API spells it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(alias = "Name", rename(serialize = "Name"))]
    service: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

impl From<&CatalogEntry> for AgentService {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            service: entry.name.clone(),
            tags: entry.tags.clone(),
            address: entry.address.clone(),
            port: entry.port,
        }
    }
}

impl From<AgentService> for CatalogEntry {
    fn from(svc: AgentService) -> Self {
        Self {
            id: svc.id,
            name: svc.service,
            address: svc.address,
            port: svc.port,
            tags: svc.tags,
        }
    }
}

/// HTTP client for one Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulCatalog {
    client: Client,
    base_url: String,
}

impl ConsulCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RpcError::Validation {
                field: "registry.address".to_string(),
                message: format!("expected an http(s) agent URL, got {}", base_url),
            });
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RpcError::Http {
            message: format!("agent returned {}: {}", status, body.trim()),
            status_code: Some(status.as_u16()),
        })
    }
}

#[async_trait::async_trait]
impl Catalog for ConsulCatalog {
    async fn ping(&self) -> Result<()> {
        let response = self.client.get(self.url("/v1/status/leader")).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn register(&self, entry: &CatalogEntry) -> Result<()> {
        let body = AgentService::from(entry);
        let response = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Consul agent accepted service {}", entry.id);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{}", id)))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn tagged(&self, tag: &str) -> Result<Vec<CatalogEntry>> {
        let response = self.client.get(self.url("/v1/agent/services")).send().await?;
        let services: HashMap<String, AgentService> = Self::check(response).await?.json().await?;

        let mut entries: Vec<CatalogEntry> = services
            .into_values()
            .filter(|svc| svc.tags.iter().any(|t| t == tag))
            .map(CatalogEntry::from)
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }
}
