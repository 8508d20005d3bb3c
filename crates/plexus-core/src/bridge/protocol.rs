//! Bridge wire format and the closed set of callable methods.
//!
//! Frames are a 4-byte big-endian length prefix followed by a UTF-8
//! JSON-RPC 2.0 payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::BridgeConfig;
use crate::error::{PlexusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Method used by a client to turn its connection into an event stream.
pub const SUBSCRIBE_EVENTS: &str = "subscribeEvents";

/// Method name carried by pushed event notifications.
pub const EVENT_NOTIFICATION: &str = "event";

/// Every call the UI process is allowed to make into the host.
///
/// Anything else is rejected with `UnsupportedOperation` before any handler
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeMethod {
    // Downloads
    StartDownload,
    AbortDownload,
    GetDownloadState,
    // Extensions
    GetActiveExtensions,
    ListExtensions,
    InstallExtension,
    UninstallExtension,
    SetActiveExtension,
    GetSettings,
    // Service dispatch
    ExecuteService,
    ExecuteServiceSerial,
    // Hardware
    GetSystemResources,
    GetCurrentLoad,
    // Model backend
    StartModel,
    StopModel,
    ModelStatus,
    Ping,
}

impl BridgeMethod {
    pub const ALL: [BridgeMethod; 17] = [
        BridgeMethod::StartDownload,
        BridgeMethod::AbortDownload,
        BridgeMethod::GetDownloadState,
        BridgeMethod::GetActiveExtensions,
        BridgeMethod::ListExtensions,
        BridgeMethod::InstallExtension,
        BridgeMethod::UninstallExtension,
        BridgeMethod::SetActiveExtension,
        BridgeMethod::GetSettings,
        BridgeMethod::ExecuteService,
        BridgeMethod::ExecuteServiceSerial,
        BridgeMethod::GetSystemResources,
        BridgeMethod::GetCurrentLoad,
        BridgeMethod::StartModel,
        BridgeMethod::StopModel,
        BridgeMethod::ModelStatus,
        BridgeMethod::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMethod::StartDownload => "startDownload",
            BridgeMethod::AbortDownload => "abortDownload",
            BridgeMethod::GetDownloadState => "getDownloadState",
            BridgeMethod::GetActiveExtensions => "getActiveExtensions",
            BridgeMethod::ListExtensions => "listExtensions",
            BridgeMethod::InstallExtension => "installExtension",
            BridgeMethod::UninstallExtension => "uninstallExtension",
            BridgeMethod::SetActiveExtension => "setActiveExtension",
            BridgeMethod::GetSettings => "getSettings",
            BridgeMethod::ExecuteService => "executeService",
            BridgeMethod::ExecuteServiceSerial => "executeServiceSerial",
            BridgeMethod::GetSystemResources => "getSystemResources",
            BridgeMethod::GetCurrentLoad => "getCurrentLoad",
            BridgeMethod::StartModel => "startModel",
            BridgeMethod::StopModel => "stopModel",
            BridgeMethod::ModelStatus => "modelStatus",
            BridgeMethod::Ping => "ping",
        }
    }
}

impl fmt::Display for BridgeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeMethod {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self> {
        BridgeMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| PlexusError::UnsupportedOperation(s.to_string()))
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

impl BridgeRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }

    /// A request without an id: a notification.
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BridgeError>,
    pub id: Option<serde_json::Value>,
}

impl BridgeResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(BridgeError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Error response built from a runtime error. Only the code and the
    /// display message leave the host.
    pub fn from_error(id: Option<serde_json::Value>, err: &PlexusError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<BridgeError> for PlexusError {
    fn from(err: BridgeError) -> Self {
        match err.code {
            -32601 => PlexusError::UnsupportedOperation(err.message),
            -32602 => PlexusError::InvalidParams {
                message: err.message,
            },
            code => PlexusError::Remote {
                code,
                message: err.message,
            },
        }
    }
}

/// Read a length-prefixed frame.
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

    if len > BridgeConfig::MAX_MESSAGE_SIZE {
        return Err(PlexusError::Validation {
            field: "bridge_frame".to_string(),
            message: format!(
                "Bridge message size {} exceeds maximum {}",
                len,
                BridgeConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > BridgeConfig::MAX_MESSAGE_SIZE {
        return Err(PlexusError::Validation {
            field: "bridge_frame".to_string(),
            message: format!("Outgoing message of {} bytes is too large", payload.len()),
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_are_closed() {
        for method in BridgeMethod::ALL {
            assert_eq!(method.as_str().parse::<BridgeMethod>().unwrap(), method);
        }

        let err = "runShellCommand".parse::<BridgeMethod>().unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32601);
        // Case matters.
        assert!("StartDownload".parse::<BridgeMethod>().is_err());
    }

    #[test]
    fn test_request_serialization() {
        let req = BridgeRequest::new("ping", serde_json::json!({}), 7);
        let json = serde_json::to_string(&req).unwrap();
        let parsed: BridgeRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.jsonrpc, "2.0");
        assert_eq!(parsed.method, "ping");
        assert_eq!(parsed.id, Some(serde_json::json!(7)));

        let note = BridgeRequest::notification("event", serde_json::json!({}));
        assert!(note.id.is_none());
    }

    #[test]
    fn test_error_response_carries_code_and_message_only() {
        let err = PlexusError::Io {
            message: "disk full".into(),
            path: Some("/secret/path".into()),
            source: None,
        };
        let resp = BridgeResponse::from_error(Some(serde_json::json!(1)), &err);
        let json = serde_json::to_string(&resp).unwrap();

        assert!(!json.contains("\"result\""));
        assert!(json.contains("-32603"));
        assert!(resp.error.unwrap().data.is_none());
    }

    #[test]
    fn test_bridge_error_maps_back_to_typed_error() {
        let err: PlexusError = BridgeError {
            code: -32601,
            message: "nope".into(),
            data: None,
        }
        .into();
        assert!(matches!(err, PlexusError::UnsupportedOperation(_)));

        let err: PlexusError = BridgeError {
            code: -32001,
            message: "No provider available for Inference.Complete".into(),
            data: None,
        }
        .into();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_frame_read_write() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}").await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor).await.unwrap(),
            Some(b"{\"a\":1}".to_vec())
        );
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (BridgeConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(PlexusError::Validation { .. })
        ));
    }
}
