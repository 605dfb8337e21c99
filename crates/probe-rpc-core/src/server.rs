//! TCP RPC server.
//!
//! Startup runs in a fixed order and aborts on the first failure:
//! configure the registry, discover the exported services, publish one
//! instance per interface, bind the listening socket, then accept.
//!
//! # Thread Safety
//!
//! The accept loop is one tokio task and every connection gets its own task.
//! Business methods run on the [`DispatchPool`]; the connection task awaits
//! the result before reading the next frame, so responses on a connection
//! leave in request order while other connections keep going.

use crate::config::{NodeConfig, RegistryConfig, ServerConfig};
use crate::directory::{ServiceContainer, ServiceDirectory};
use crate::error::{Result, RpcError};
use crate::pool::DispatchPool;
use crate::protocol::{decode_request, encode, read_frame, write_frame, RpcRequest, RpcResponse};
use crate::registry::{Registry, ServiceInstance};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    AwaitingRequest,
    Decoding,
    Dispatching,
    Encoding,
    ResponseSent,
    Closed,
}

struct Connection {
    peer: SocketAddr,
    state: ConnectionState,
}

impl Connection {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            state: ConnectionState::Connected,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }
}

/// Handle to a running server. Dropping it stops the accept loop.
pub struct RpcServerHandle {
    addr: SocketAddr,
    directory: ServiceDirectory,
    registry: Arc<Registry>,
    instances: Vec<ServiceInstance>,
    deregister_on_shutdown: bool,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Instances published during startup, one per interface.
    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Stop accepting, close open connections and, when
    /// `deregister_on_shutdown` is set, remove the published instances.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.signal_shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }

        if self.deregister_on_shutdown {
            for instance in &self.instances {
                self.registry.deregister(instance).await?;
                info!("Deregistered {}", instance.id);
            }
        }
        Ok(())
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RpcServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerHandle")
            .field("addr", &self.addr)
            .field("registry", &self.registry)
            .field("instances", &self.instances.len())
            .finish()
    }
}

/// Server builder.
pub struct RpcServer {
    config: ServerConfig,
    registry_config: RegistryConfig,
    registry: Option<Registry>,
    pool: Option<Arc<DispatchPool>>,
}

impl RpcServer {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            config: config.server.clone(),
            registry_config: config.registry.clone(),
            registry: None,
            pool: None,
        }
    }

    /// Publish to an already configured registry instead of building one
    /// from `RegistryConfig`.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run business methods on `pool` instead of the process-wide pool.
    pub fn with_pool(mut self, pool: Arc<DispatchPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Start the server.
    ///
    /// Returns once the socket is listening; connections are served by
    /// background tasks.
    pub async fn start(self, container: &dyn ServiceContainer) -> Result<RpcServerHandle> {
        let listen_addr = self.config.listen_addr()?;
        if listen_addr.port() == 0 {
            return Err(RpcError::Validation {
                field: "server.port".to_string(),
                message: "port must be concrete: it is published before the socket binds"
                    .to_string(),
            });
        }

        let registry = match self.registry {
            Some(registry) => registry,
            None => Registry::configure(&self.registry_config).await?,
        };

        let directory = ServiceDirectory::discover(container)?;

        let mut instances = Vec::with_capacity(directory.len());
        for interface in directory.interfaces() {
            let instance =
                ServiceInstance::new(&self.config.host, listen_addr.port(), interface, registry.kind());
            registry.register(&instance).await.map_err(|e| match e {
                RpcError::RegistrationFailed { .. } => e,
                other => RpcError::RegistrationFailed {
                    id: instance.id.clone(),
                    message: other.to_string(),
                },
            })?;
            info!("Registered {} at {}", interface, instance.endpoint());
            instances.push(instance);
        }

        let listener = Self::bind(&self.config, listen_addr)?;
        let addr = listener.local_addr()?;
        info!("RPC server listening on {}", addr);

        let pool = self.pool.unwrap_or_else(DispatchPool::global);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            directory.clone(),
            pool,
            self.config.nodelay,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(RpcServerHandle {
            addr,
            directory,
            registry: Arc::new(registry),
            instances,
            deregister_on_shutdown: self.config.deregister_on_shutdown,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    fn bind(config: &ServerConfig, addr: SocketAddr) -> Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_send_buffer_size(config.send_buffer_size)?;
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
        socket.bind(addr)?;
        Ok(socket.listen(config.backlog)?)
    }

    async fn accept_loop(
        listener: TcpListener,
        directory: ServiceDirectory,
        pool: Arc<DispatchPool>,
        nodelay: bool,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(nodelay) {
                                warn!("Cannot set TCP_NODELAY for {}: {}", peer_addr, e);
                            }

                            let directory = directory.clone();
                            let pool = pool.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("RPC connection from {}", peer_addr);
                                let mut conn = Connection::new(peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    &mut conn,
                                    &directory,
                                    &pool,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("RPC connection {} ended: {}", peer_addr, e);
                                }
                                conn.transition(ConnectionState::Closed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        conn: &mut Connection,
        directory: &ServiceDirectory,
        pool: &Arc<DispatchPool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            conn.transition(ConnectionState::AwaitingRequest);
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Peer closed
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            conn.transition(ConnectionState::Decoding);
            let response = match decode_request(&frame) {
                Ok(request) => {
                    conn.transition(ConnectionState::Dispatching);
                    Self::process_request(request, directory, pool).await
                }
                Err(e) => {
                    debug!("{}: {}", conn.peer, e);
                    RpcResponse::from_error(None, &e)
                }
            };

            conn.transition(ConnectionState::Encoding);
            let response_bytes = encode(&response)?;
            write_frame(&mut writer, &response_bytes).await?;
            conn.transition(ConnectionState::ResponseSent);
        }
    }

    async fn process_request(
        request: RpcRequest,
        directory: &ServiceDirectory,
        pool: &DispatchPool,
    ) -> RpcResponse {
        let request_id = request.request_id.clone();
        let target = format!("{}.{}", request.interface_name, request.method_name);

        match Self::dispatch(request, directory, pool).await {
            Ok(result) => {
                debug!("{} completed", target);
                RpcResponse::success(request_id, result)
            }
            Err(e) => {
                match e {
                    RpcError::Overloaded { .. } => warn!("{} rejected: {}", target, e),
                    _ => debug!("{} failed: {}", target, e),
                }
                RpcResponse::from_error(request_id, &e)
            }
        }
    }

    async fn dispatch(
        request: RpcRequest,
        directory: &ServiceDirectory,
        pool: &DispatchPool,
    ) -> Result<Value> {
        let handler = directory.lookup(
            &request.interface_name,
            &request.method_name,
            &request.parameter_types,
            request.parameters.len(),
        )?;

        let parameters = request.parameters;
        pool.run(move || handler(parameters))
            .await?
            .map_err(|message| RpcError::InvocationFailed { message })
    }
}
