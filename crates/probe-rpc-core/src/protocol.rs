//! Wire records and framing shared by the server and the client.
//!
//! Every message is a 4-byte big-endian length prefix followed by a UTF-8
//! JSON document:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! One request frame is answered by exactly one response frame on the same
//! connection.

use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A single call addressed to one method of one interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Correlates the response with this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub interface_name: String,
    pub method_name: String,
    /// Ordered parameter type names, used to pick between overloads.
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

impl RpcRequest {
    pub fn new(interface_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            request_id: None,
            interface_name: interface_name.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Append one typed argument.
    pub fn arg(mut self, parameter_type: impl Into<String>, value: Value) -> Self {
        self.parameter_types.push(parameter_type.into());
        self.parameters.push(value);
        self
    }

    /// Set the arguments without declaring their types.
    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Why a call failed on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    ServiceNotFound,
    MethodNotFound,
    Overloaded,
    InvocationFailed,
    MalformedRequest,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FaultKind::ServiceNotFound => "ServiceNotFound",
            FaultKind::MethodNotFound => "MethodNotFound",
            FaultKind::Overloaded => "Overloaded",
            FaultKind::InvocationFailed => "InvocationFailed",
            FaultKind::MalformedRequest => "MalformedRequest",
        };
        write!(f, "{}", s)
    }
}

/// Failure description carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub kind: FaultKind,
    pub message: String,
}

/// Outcome of one call. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(request_id: Option<String>, result: Value) -> Self {
        Self {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    /// Create a failure response.
    pub fn failure(request_id: Option<String>, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            request_id,
            result: None,
            error: Some(RpcFault {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Create a failure response from a per-request error.
    pub fn from_error(request_id: Option<String>, err: &RpcError) -> Self {
        Self::failure(request_id, err.fault_kind(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn the response back into a `Result`; a fault becomes
    /// `RpcError::Remote` carrying its kind.
    pub fn into_result(self) -> Result<Value> {
        if let Some(fault) = self.error {
            return Err(RpcError::Remote {
                kind: fault.kind,
                message: fault.message,
            });
        }
        // A response without an error and without a result carries `null`
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(RpcError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(RpcError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame size {} exceeds maximum {}",
                payload.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a record into a frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode a request frame payload.
pub fn decode_request(payload: &[u8]) -> Result<RpcRequest> {
    serde_json::from_slice(payload).map_err(|e| RpcError::MalformedRequest {
        message: format!("cannot decode request: {}", e),
    })
}

/// Decode a response frame payload.
pub fn decode_response(payload: &[u8]) -> Result<RpcResponse> {
    serde_json::from_slice(payload).map_err(|e| RpcError::Json {
        message: format!("cannot decode response: {}", e),
        source: Some(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_uses_camel_case_on_the_wire() {
        let req = RpcRequest::new("Greeter", "echo")
            .arg("string", json!("hi"))
            .with_request_id("r-1");
        let wire = serde_json::to_value(&req).unwrap();

        assert_eq!(wire["interfaceName"], "Greeter");
        assert_eq!(wire["methodName"], "echo");
        assert_eq!(wire["parameterTypes"], json!(["string"]));
        assert_eq!(wire["parameters"], json!(["hi"]));
        assert_eq!(wire["requestId"], "r-1");
    }

    #[test]
    fn test_request_without_types_or_id_decodes() {
        let req = decode_request(
            br#"{"interfaceName":"Greeter","methodName":"echo","parameters":["hi"]}"#,
        )
        .unwrap();
        assert!(req.request_id.is_none());
        assert!(req.parameter_types.is_empty());
        assert_eq!(req.parameters, vec![json!("hi")]);
    }

    #[test]
    fn test_decode_request_garbage_is_malformed() {
        let err = decode_request(b"not json").unwrap_err();
        assert!(matches!(err, RpcError::MalformedRequest { .. }));
    }

    #[test]
    fn test_response_success_omits_error() {
        let resp = RpcResponse::success(Some("1".into()), json!("hi"));
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
        assert_eq!(resp.into_result().unwrap(), json!("hi"));
    }

    #[test]
    fn test_response_failure_maps_back_to_error() {
        let resp = RpcResponse::failure(None, FaultKind::ServiceNotFound, "Missing");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"result\""));
        assert!(json.contains("ServiceNotFound"));

        let err = resp.into_result().unwrap_err();
        assert_eq!(err.fault_kind(), FaultKind::ServiceNotFound);
        assert_eq!(err.to_string(), "ServiceNotFound: Missing");
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
