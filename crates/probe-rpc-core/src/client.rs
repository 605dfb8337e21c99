//! TCP RPC client.
//!
//! Every call opens a fresh connection, writes one request frame, waits for
//! the matching response frame and closes the connection.

use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{decode_response, encode, read_frame, write_frame, RpcRequest, RpcResponse};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;
use uuid::Uuid;

/// Client issuing one call per connection.
#[derive(Debug, Clone, Default)]
pub struct RpcClient {
    config: ClientConfig,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `request` to `addr` and wait for its response.
    ///
    /// A request without an id is given a fresh UUID. Server-side failures
    /// come back inside the response; only transport problems are `Err`.
    pub async fn call(&self, addr: SocketAddr, mut request: RpcRequest) -> Result<RpcResponse> {
        let request_id = request
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let payload = encode(&request)?;

        let mut stream = self.connect(addr).await?;
        debug!(
            "Calling {}.{} on {} ({})",
            request.interface_name, request.method_name, addr, request_id
        );

        let (mut reader, mut writer) = stream.split();
        write_frame(&mut writer, &payload).await?;

        let frame = match self.config.read_timeout() {
            Some(limit) => tokio::time::timeout(limit, read_frame(&mut reader))
                .await
                .map_err(|_| RpcError::ReadTimeout(limit))??,
            None => read_frame(&mut reader).await?,
        };
        let frame = frame.ok_or_else(|| RpcError::ConnectionClosed {
            addr: addr.to_string(),
        })?;
        let response = decode_response(&frame)?;

        if response.request_id.as_deref() != Some(request_id.as_str()) {
            return Err(RpcError::ResponseMismatch {
                expected: request_id,
                actual: response.request_id,
            });
        }

        let _ = stream.shutdown().await;
        Ok(response)
    }

    /// Resolve `endpoint` (`host:port`) and call the first address it yields.
    pub async fn call_endpoint(&self, endpoint: &str, request: RpcRequest) -> Result<RpcResponse> {
        let addr = tokio::net::lookup_host(endpoint)
            .await
            .map_err(|e| RpcError::ConnectFailed {
                addr: endpoint.to_string(),
                message: e.to_string(),
            })?
            .next()
            .ok_or_else(|| RpcError::ConnectFailed {
                addr: endpoint.to_string(),
                message: "no address resolved".to_string(),
            })?;
        self.call(addr, request).await
    }

    /// Blocking form of [`RpcClient::call`] for callers outside any tokio
    /// runtime. Runs the call on a private current-thread runtime.
    ///
    /// Fails with a validation error when called from within a runtime.
    pub fn call_blocking(&self, addr: SocketAddr, request: RpcRequest) -> Result<RpcResponse> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(RpcError::Validation {
                field: "runtime".to_string(),
                message: "call_blocking cannot run inside a tokio runtime; use call".to_string(),
            });
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.call(addr, request))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let connect_failed = |message: String| RpcError::ConnectFailed {
            addr: addr.to_string(),
            message,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| connect_failed(e.to_string()))?;
        socket
            .set_send_buffer_size(self.config.send_buffer_size)
            .map_err(|e| connect_failed(e.to_string()))?;
        socket
            .set_recv_buffer_size(self.config.recv_buffer_size)
            .map_err(|e| connect_failed(e.to_string()))?;

        let timeout = self.config.connect_timeout();
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| connect_failed(format!("timed out after {:?}", timeout)))?
            .map_err(|e| connect_failed(e.to_string()))?;

        stream
            .set_nodelay(self.config.nodelay)
            .map_err(|e| connect_failed(e.to_string()))?;
        Ok(stream)
    }
}
