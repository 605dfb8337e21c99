//! Error types for probe-rpc.
//!
//! Startup failures (registry, discovery, registration, bind) surface as
//! `Err` from [`RpcServer::start`](crate::server::RpcServer::start). Per-request
//! failures are carried back to the caller inside `RpcResponse.error` and only
//! become an [`RpcError`] again on the client side.

use crate::protocol::FaultKind;
use std::time::Duration;
use thiserror::Error;

/// Main error type for probe-rpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Registry errors
    #[error("Registry unreachable at {address}: {message}")]
    RegistryUnreachable { address: String, message: String },

    #[error("Registration of {id} failed: {message}")]
    RegistrationFailed { id: String, message: String },

    // Discovery errors
    #[error("Cannot resolve a single target interface for service bean {bean}: {message}")]
    AmbiguousOrMissingInterfaceTag { bean: String, message: String },

    // Dispatch errors
    #[error("Service not found: {interface}")]
    ServiceNotFound { interface: String },

    #[error("Method not found: {interface}.{method}({})", parameter_types.join(", "))]
    MethodNotFound {
        interface: String,
        method: String,
        parameter_types: Vec<String>,
    },

    #[error("Dispatch pool overloaded: {pending} tasks pending")]
    Overloaded { pending: usize },

    #[error("Invocation failed: {message}")]
    InvocationFailed { message: String },

    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },

    /// A failure reported by the server inside a response.
    #[error("{kind}: {message}")]
    Remote { kind: FaultKind, message: String },

    // Client errors
    #[error("Failed to connect to {addr}: {message}")]
    ConnectFailed { addr: String, message: String },

    #[error("No response within {0:?}")]
    ReadTimeout(Duration),

    #[error("Connection to {addr} closed before a response arrived")]
    ConnectionClosed { addr: String },

    #[error("Response id mismatch: expected {expected}, got {actual:?}")]
    ResponseMismatch {
        expected: String,
        actual: Option<String>,
    },

    // Ambient errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("HTTP error: {message}")]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for probe-rpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for RpcError {
    fn from(err: rusqlite::Error) -> Self {
        RpcError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Http {
            message: err.to_string(),
            status_code: err.status().map(|s| s.as_u16()),
        }
    }
}

impl From<config::ConfigError> for RpcError {
    fn from(err: config::ConfigError) -> Self {
        RpcError::Config {
            message: err.to_string(),
        }
    }
}

impl RpcError {
    /// Map a per-request error onto the fault kind carried in a response.
    ///
    /// Anything that is not one of the dispatch failures is reported as an
    /// invocation failure.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            RpcError::Remote { kind, .. } => *kind,
            RpcError::ServiceNotFound { .. } => FaultKind::ServiceNotFound,
            RpcError::MethodNotFound { .. } => FaultKind::MethodNotFound,
            RpcError::Overloaded { .. } => FaultKind::Overloaded,
            RpcError::MalformedRequest { .. }
            | RpcError::Json { .. }
            | RpcError::Validation { .. } => FaultKind::MalformedRequest,
            _ => FaultKind::InvocationFailed,
        }
    }

    /// True for failures that abort server startup.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            RpcError::RegistryUnreachable { .. }
                | RpcError::RegistrationFailed { .. }
                | RpcError::AmbiguousOrMissingInterfaceTag { .. }
                | RpcError::Config { .. }
                | RpcError::Io { .. }
        )
    }
}
