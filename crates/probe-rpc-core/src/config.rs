//! Centralized configuration for probe-rpc.
//!
//! Two layers live here:
//! - constant tables (`ProtocolConfig`, `SocketDefaults`, `PoolDefaults`,
//!   `RegistryDefaults`) holding the fixed limits and default values;
//! - serde structs (`NodeConfig` and its sections) loaded from several sources
//!   in order of precedence:
//!   1. defaults embedded in the binary (`config/default.toml`)
//!   2. an optional user-specified TOML file
//!   3. environment variables prefixed with `PROBE_RPC_`, using `__` between
//!      nested keys (e.g. `PROBE_RPC_SERVER__PORT=9000`)
//!
//!   Command-line overrides are applied by the binary on top of the result.

use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Wire protocol limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest frame accepted in either direction.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Socket defaults shared by the server and the client.
pub struct SocketDefaults;

impl SocketDefaults {
    pub const HOST: &'static str = "127.0.0.1";
    pub const PORT: u16 = 8090;
    pub const BACKLOG: u32 = 1024;
    pub const SEND_BUFFER_SIZE: u32 = 32 * 1024;
    pub const RECV_BUFFER_SIZE: u32 = 32 * 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Dispatch pool sizing defaults.
pub struct PoolDefaults;

impl PoolDefaults {
    pub const QUEUE_CAPACITY: usize = 20_480;
    pub const KEEP_ALIVE: Duration = Duration::from_millis(200);
    pub const THREAD_NAME_PREFIX: &'static str = "rpc-dispatch";
}

/// Registry defaults.
pub struct RegistryDefaults;

impl RegistryDefaults {
    /// Address selecting the in-process store of either backend.
    pub const MEMORY_ADDRESS: &'static str = "memory";
    pub const BASE_PATH: &'static str = "/probe-rpc";
    pub const SCHEME: &'static str = "tcp";
    pub const TIMEOUT: Duration = Duration::from_secs(5);
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Which registry backend a process publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackendKind {
    /// Hierarchical-path registry (Zookeeper-style nodes).
    #[serde(alias = "zookeeper")]
    Path,
    /// Flat key/tag registry (Consul-style catalog).
    #[serde(alias = "consul")]
    Flat,
}

impl RegistryBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryBackendKind::Path => "path",
            RegistryBackendKind::Flat => "flat",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "path" | "zookeeper" => Some(RegistryBackendKind::Path),
            "flat" | "consul" => Some(RegistryBackendKind::Flat),
            _ => None,
        }
    }
}

impl Default for RegistryBackendKind {
    fn default() -> Self {
        RegistryBackendKind::Path
    }
}

impl std::fmt::Display for RegistryBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Complete configuration of a probe-rpc node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    pub pool: PoolConfig,
}

impl NodeConfig {
    /// Load configuration from the embedded defaults, an optional file, and
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PROBE_RPC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot be served.
    pub fn validate(&self) -> Result<()> {
        self.server.listen_addr()?;
        if self.server.port == 0 {
            return Err(RpcError::Validation {
                field: "server.port".to_string(),
                message: "port must be concrete: it is published before the socket binds"
                    .to_string(),
            });
        }
        if self.registry.address.trim().is_empty() {
            return Err(RpcError::Validation {
                field: "registry.address".to_string(),
                message: "registry address is empty".to_string(),
            });
        }
        if self.pool.queue_capacity == 0 {
            return Err(RpcError::Validation {
                field: "pool.queue_capacity".to_string(),
                message: "queue capacity must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Listening socket and server behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, also the address published to the registry.
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,
    pub nodelay: bool,
    /// I/O worker threads for the runtime (None = 2 x logical CPUs).
    pub io_threads: Option<usize>,
    /// Remove published instances when the server is shut down explicitly.
    pub deregister_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: SocketDefaults::HOST.to_string(),
            port: SocketDefaults::PORT,
            backlog: SocketDefaults::BACKLOG,
            send_buffer_size: SocketDefaults::SEND_BUFFER_SIZE,
            recv_buffer_size: SocketDefaults::RECV_BUFFER_SIZE,
            nodelay: true,
            io_threads: None,
            deregister_on_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.host.parse().map_err(|_| RpcError::Validation {
            field: "server.host".to_string(),
            message: format!("not an IP address: {}", self.host),
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn io_threads(&self) -> usize {
        self.io_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(|| num_cpus::get() * 2)
    }
}

/// Registry backend selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackendKind,
    /// `memory`, a SQLite path (`sqlite://...`) for the path backend, or an
    /// agent URL (`http://...`) for the flat backend.
    pub address: String,
    /// Root under which the path backend creates service nodes.
    pub base_path: String,
    /// Scheme advertised in the path backend's URI template.
    pub scheme: String,
    pub timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackendKind::default(),
            address: RegistryDefaults::MEMORY_ADDRESS.to_string(),
            base_path: RegistryDefaults::BASE_PATH.to_string(),
            scheme: RegistryDefaults::SCHEME.to_string(),
            timeout_ms: RegistryDefaults::TIMEOUT.as_millis() as u64,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_memory(&self) -> bool {
        self.address.eq_ignore_ascii_case(RegistryDefaults::MEMORY_ADDRESS)
    }
}

/// Client socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    /// Deadline for the response. Unset means the call waits indefinitely.
    pub read_timeout_ms: Option<u64>,
    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: SocketDefaults::CONNECT_TIMEOUT.as_millis() as u64,
            read_timeout_ms: None,
            send_buffer_size: SocketDefaults::SEND_BUFFER_SIZE,
            recv_buffer_size: SocketDefaults::RECV_BUFFER_SIZE,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

/// Dispatch pool sizing. Unset thread counts follow the logical CPU count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub core_threads: Option<usize>,
    pub max_threads: Option<usize>,
    pub keep_alive_ms: u64,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: None,
            max_threads: None,
            keep_alive_ms: PoolDefaults::KEEP_ALIVE.as_millis() as u64,
            queue_capacity: PoolDefaults::QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    pub fn core_threads(&self) -> usize {
        self.core_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(num_cpus::get)
    }

    /// Never below the core size.
    pub fn max_threads(&self) -> usize {
        let core = self.core_threads();
        self.max_threads.unwrap_or(core * 2).max(core)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backend_kind_roundtrip() {
        for kind in [RegistryBackendKind::Path, RegistryBackendKind::Flat] {
            let parsed = RegistryBackendKind::from_str(kind.as_str()).expect("Should parse");
            assert_eq!(kind, parsed);
        }
        assert_eq!(
            RegistryBackendKind::from_str("Consul"),
            Some(RegistryBackendKind::Flat)
        );
        assert_eq!(RegistryBackendKind::from_str("etcd"), None);
    }

    #[test]
    fn test_load_defaults() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.send_buffer_size, 32 * 1024);
        assert!(!config.server.deregister_on_shutdown);
        assert_eq!(config.registry.backend, RegistryBackendKind::Path);
        assert!(config.registry.is_memory());
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.read_timeout(), None);
        assert_eq!(config.pool.queue_capacity, PoolDefaults::QUEUE_CAPACITY);
        assert_eq!(config.pool.keep_alive(), Duration::from_millis(200));
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 9300\n\n[registry]\nbackend = \"consul\"\naddress = \"http://127.0.0.1:8500\"\n\n[client]\nread_timeout_ms = 1500"
        )
        .unwrap();

        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9300);
        assert_eq!(config.registry.backend, RegistryBackendKind::Flat);
        assert_eq!(config.registry.address, "http://127.0.0.1:8500");
        assert_eq!(
            config.client.read_timeout(),
            Some(Duration::from_millis(1500))
        );
        // Untouched sections keep their defaults
        assert_eq!(config.server.backlog, 1024);
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut config = NodeConfig::default();
        config.server.port = 0;
        assert!(matches!(
            config.validate(),
            Err(RpcError::Validation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_host() {
        let mut config = NodeConfig::default();
        config.server.host = "not-an-ip".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_sizing_follows_cpus() {
        let pool = PoolConfig::default();
        assert_eq!(pool.core_threads(), num_cpus::get());
        assert_eq!(pool.max_threads(), num_cpus::get() * 2);

        let pool = PoolConfig {
            core_threads: Some(4),
            max_threads: Some(2),
            ..PoolConfig::default()
        };
        assert_eq!(pool.max_threads(), 4);
    }
}
