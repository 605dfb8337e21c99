//! The record a server publishes for each interface it exposes.

use crate::config::RegistryBackendKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One published `(address, port, interface)` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `address:port:interfaceName`, unique per registration.
    pub id: String,
    pub address: String,
    pub port: u16,
    pub interface_name: String,
    pub registry_backend: RegistryBackendKind,
    /// RFC 3339 UTC timestamp of creation.
    pub registered_at: String,
}

impl ServiceInstance {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        interface_name: impl Into<String>,
        registry_backend: RegistryBackendKind,
    ) -> Self {
        let address = address.into();
        let interface_name = interface_name.into();
        Self {
            id: Self::make_id(&address, port, &interface_name),
            address,
            port,
            interface_name,
            registry_backend,
            registered_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn make_id(address: &str, port: u16, interface_name: &str) -> String {
        format!("{}:{}:{}", address, port, interface_name)
    }

    /// `host:port`, suitable for `SocketAddr` parsing or dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Expand a `{scheme}://{address}:{port}` style template.
    pub fn uri(&self, template: &str, scheme: &str) -> String {
        template
            .replace("{scheme}", scheme)
            .replace("{address}", &self.address)
            .replace("{port}", &self.port.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format() {
        let instance = ServiceInstance::new("10.0.0.5", 8090, "Greeter", RegistryBackendKind::Flat);
        assert_eq!(instance.id, "10.0.0.5:8090:Greeter");
        assert_eq!(instance.endpoint(), "10.0.0.5:8090");
        assert!(!instance.registered_at.is_empty());
    }

    #[test]
    fn test_uri_template() {
        let instance = ServiceInstance::new("10.0.0.5", 8090, "Greeter", RegistryBackendKind::Path);
        assert_eq!(
            instance.uri("{scheme}://{address}:{port}", "tcp"),
            "tcp://10.0.0.5:8090"
        );
    }
}
