//! Centralized configuration for the Plexus runtime.
//!
//! Constants for network transfers, queue behavior, the bridge, the local
//! model backend and on-disk layout.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "Plexus";
    pub const DATA_DIR_NAME: &'static str = "plexus";
    pub const USER_AGENT: &'static str = concat!("Plexus/", env!("CARGO_PKG_VERSION"));
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;
}

/// Bounded queue configuration.
pub struct QueueConfig;

impl QueueConfig {
    /// Limit applied to a concurrency class that was never configured.
    pub const DEFAULT_CLASS_LIMIT: usize = 1;
    /// Class used for hardware status queries.
    pub const HARDWARE_CLASS: &'static str = "hardware";
    /// Class used for calls into the local model backend.
    pub const BACKEND_CLASS: &'static str = "backend";
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);
}

/// Host/UI bridge configuration.
pub struct BridgeConfig;

impl BridgeConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 32;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const BIND_HOST: &'static str = "127.0.0.1";
}

/// Local model-serving backend timing.
pub struct BackendTimings;

impl BackendTimings {
    pub const DEFAULT_PORT: u16 = 3928;
    pub const HEALTH_ATTEMPTS: u32 = 5;
    pub const LOAD_ATTEMPTS: u32 = 3;
    pub const RETRY_DELAY: Duration = Duration::from_millis(500);
    pub const PORT_POLL_INTERVAL: Duration = Duration::from_millis(300);
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const KILL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const TERM_GRACE: Duration = Duration::from_secs(2);
}

/// Directory and file names under the data directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const EXTENSIONS_DIR_NAME: &'static str = "extensions";
    pub const THREADS_DIR_NAME: &'static str = "threads";
    pub const MODELS_DIR_NAME: &'static str = "models";
    pub const MODEL_METADATA_FILE_NAME: &'static str = "model.json";
    pub const LOGS_DIR_NAME: &'static str = "logs";
    pub const SETTINGS_FILE_NAME: &'static str = "settings.json";
    pub const MANIFEST_FILE_NAME: &'static str = "manifest.json";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(BackendTimings::STARTUP_TIMEOUT > BackendTimings::PORT_POLL_INTERVAL);
        assert!(NetworkConfig::REQUEST_TIMEOUT > Duration::ZERO);
        assert_eq!(QueueConfig::DEFAULT_CLASS_LIMIT, 1);
    }
}
