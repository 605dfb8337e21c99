//! probe-rpc - a minimal RPC framework.
//!
//! A server publishes each interface it exposes to a service registry, then
//! answers length-prefixed JSON calls over TCP. Business methods run on a
//! bounded worker pool so a slow call never stalls the I/O threads. A client
//! dials an address, sends one request and waits for its response.
//!
//! # Example
//!
//! ```rust,ignore
//! use probe_rpc::{NodeConfig, RpcClient, RpcRequest, RpcServer, ServiceImpl, StaticContainer};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> probe_rpc::Result<()> {
//!     let config = NodeConfig::load(None)?;
//!
//!     let greeter = ServiceImpl::builder()
//!         .implements("Greeter")
//!         .method("echo", ["string"], |args| Ok(args[0].clone()))
//!         .build();
//!     let container = StaticContainer::new().with("greeterImpl", greeter);
//!
//!     let handle = RpcServer::new(&config).start(&container).await?;
//!
//!     let client = RpcClient::new(config.client.clone());
//!     let request = RpcRequest::new("Greeter", "echo").arg("string", json!("hi"));
//!     let response = client.call(handle.addr(), request).await?;
//!     assert_eq!(response.into_result()?, json!("hi"));
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::RpcClient;
pub use config::{
    ClientConfig, NodeConfig, PoolConfig, RegistryBackendKind, RegistryConfig, ServerConfig,
};
pub use directory::{
    MethodHandler, MethodSignature, ServiceContainer, ServiceDirectory, ServiceImpl,
    StaticContainer,
};
pub use error::{Result, RpcError};
pub use pool::DispatchPool;
pub use protocol::{FaultKind, RpcFault, RpcRequest, RpcResponse};
pub use registry::{Registry, ServiceInstance};
pub use server::{RpcServer, RpcServerHandle};
