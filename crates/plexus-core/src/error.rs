//! Error types for the Plexus runtime.
//!
//! Every component converts its internal failures into `PlexusError` at its
//! public boundary. Only the JSON-RPC code and display message of an error
//! ever cross the host/UI bridge.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Plexus runtime.
#[derive(Debug, Error)]
pub enum PlexusError {
    // Not-found errors
    #[error("No provider available for {service}")]
    Unavailable { service: String },

    #[error("Extension not found: {name}")]
    ExtensionNotFound { name: String },

    #[error("No active download for key {key}")]
    DownloadNotFound { key: String },

    #[error("Conversation not found: {id}")]
    ThreadNotFound { id: String },

    #[error("Model not found: {id}")]
    ModelNotFound { id: String },

    // Extension lifecycle errors
    #[error("Failed to activate extension {name}: {message}")]
    ActivationFailed { name: String, message: String },

    #[error("Extension installation failed: {message}")]
    InstallationFailed { message: String },

    #[error("Invalid extension manifest: {message}")]
    InvalidManifest { message: String },

    // Transfer errors
    #[error("Download already in progress for key {key}")]
    DownloadInProgress { key: String },

    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Download cancelled")]
    DownloadCancelled,

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    // Queue errors
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<PlexusError>,
    },

    // Bridge violations
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Bridge connection lost ({addr})")]
    BridgeDisconnected { addr: String },

    /// Error returned by the other side of the bridge, code preserved.
    #[error("{message}")]
    Remote { code: i32, message: String },

    // Backend process errors
    #[error("Backend launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("Backend is not running")]
    BackendNotRunning,

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for Plexus operations.
pub type Result<T> = std::result::Result<T, PlexusError>;

impl From<std::io::Error> for PlexusError {
    fn from(err: std::io::Error) -> Self {
        PlexusError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PlexusError {
    fn from(err: serde_json::Error) -> Self {
        PlexusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for PlexusError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PlexusError::Timeout(std::time::Duration::from_secs(0))
        } else {
            PlexusError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl PlexusError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PlexusError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes: -32601 (method not found), -32602 (invalid params),
    /// -32603 (internal error).
    ///
    /// Application codes:
    /// - -32000: Network/connectivity error
    /// - -32001: Not found (no provider, unknown extension, download or thread)
    /// - -32002: Extension activation/installation failure
    /// - -32003: Transfer failure
    /// - -32004: Cancelled by user
    /// - -32005: Validation error
    /// - -32006: Retries exhausted
    /// - -32007: Conflicting request (download already running)
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            PlexusError::UnsupportedOperation(_) => -32601,
            PlexusError::InvalidParams { .. } => -32602,

            PlexusError::Network { .. }
            | PlexusError::Timeout(_)
            | PlexusError::BridgeDisconnected { .. } => -32000,

            PlexusError::Unavailable { .. }
            | PlexusError::ExtensionNotFound { .. }
            | PlexusError::DownloadNotFound { .. }
            | PlexusError::ThreadNotFound { .. }
            | PlexusError::ModelNotFound { .. }
            | PlexusError::BackendNotRunning => -32001,

            PlexusError::ActivationFailed { .. }
            | PlexusError::InstallationFailed { .. }
            | PlexusError::InvalidManifest { .. }
            | PlexusError::LaunchFailed { .. } => -32002,

            PlexusError::DownloadFailed { .. } | PlexusError::HashMismatch { .. } => -32003,

            PlexusError::DownloadCancelled => -32004,

            PlexusError::Validation { .. } => -32005,

            PlexusError::RetriesExhausted { .. } => -32006,

            PlexusError::DownloadInProgress { .. } => -32007,

            PlexusError::Remote { code, .. } => *code,

            _ => -32603,
        }
    }

    /// Short machine-readable code carried by `download.error` events.
    pub fn error_code(&self) -> &'static str {
        match self {
            PlexusError::Network { .. } | PlexusError::Timeout(_) => "NETWORK",
            PlexusError::DownloadFailed { .. } => "TRANSFER",
            PlexusError::HashMismatch { .. } => "HASH_MISMATCH",
            PlexusError::Io { .. } => "IO",
            PlexusError::DownloadCancelled => "CANCELLED",
            _ => "INTERNAL",
        }
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlexusError::Network { .. } | PlexusError::Timeout(_) | PlexusError::Io { .. }
        )
    }

    /// Whether this error is an expected "nothing configured" condition the
    /// UI should render as a fallback state.
    pub fn is_not_found(&self) -> bool {
        self.to_rpc_error_code() == -32001
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlexusError::Unavailable {
            service: "CreateConversation".into(),
        };
        assert_eq!(err.to_string(), "No provider available for CreateConversation");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            PlexusError::UnsupportedOperation("rm -rf".into()).to_rpc_error_code(),
            -32601
        );
        assert_eq!(PlexusError::DownloadCancelled.to_rpc_error_code(), -32004);
        assert_eq!(
            PlexusError::RetriesExhausted {
                attempts: 3,
                last_error: Box::new(PlexusError::Other("boom".into())),
            }
            .to_rpc_error_code(),
            -32006
        );
        assert_eq!(PlexusError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_not_found_family() {
        assert!(PlexusError::ExtensionNotFound { name: "a".into() }.is_not_found());
        assert!(PlexusError::DownloadNotFound { key: "k".into() }.is_not_found());
        assert!(!PlexusError::DownloadCancelled.is_not_found());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PlexusError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!PlexusError::Unavailable {
            service: "x".into()
        }
        .is_retryable());
    }
}
