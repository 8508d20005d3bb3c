//! Plexus Core - headless extension runtime for a local AI assistant.
//!
//! Extensions are packages that provide capabilities (conversation storage,
//! inference, system monitoring, ...). The runtime keeps a catalog of them,
//! activates one per capability type, routes service calls to the active
//! provider, runs downloads and backend calls under bounded concurrency, and
//! exposes all of it to a UI process over a loopback JSON-RPC bridge.
//!
//! # Example
//!
//! ```rust,ignore
//! use plexus_core::{BridgeServer, PlexusRuntime, ServiceName};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> plexus_core::Result<()> {
//!     let runtime = Arc::new(PlexusRuntime::new("/path/to/plexus")?);
//!     runtime.init().await?;
//!     runtime.load().await?;
//!
//!     let outcome = runtime
//!         .execute(ServiceName::CreateConversation, json!({ "title": "Hello" }))
//!         .await?;
//!     println!("{}", outcome.to_json());
//!
//!     let server = BridgeServer::start(runtime.clone()).await?;
//!     println!("bridge on {}", server.addr());
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod backend;
pub mod bridge;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extension;
pub mod network;
pub mod queue;
pub mod settings;
pub mod system;

mod runtime;

// Re-export commonly used types
pub use backend::{BackendConfig, BackendController, BackendStatus};
pub use bridge::{
    BridgeClient, BridgeDispatch, BridgeEvent, BridgeEventStream, BridgeMethod, BridgeServer,
    BridgeServerHandle, EventBus, EventSubscription, EventTopic,
};
pub use cancel::CancelHandle;
pub use dispatch::{handler_fn, DispatchOutcome, Dispatcher, ServiceHandler, ServiceName, ServiceRegistry};
pub use error::{PlexusError, Result};
pub use extension::{
    ActivationPoint, BuiltinLoader, CapabilityType, Extension, ExtensionContext, ExtensionLoader,
    ExtensionManifest, ExtensionRecord, ExtensionRegistry, InstallReport, InstallationState,
};
pub use network::{
    DownloadHandle, DownloadManager, DownloadOutcome, DownloadRequest, DownloadSnapshot,
    DownloadSource, DownloadState, HttpSource, SourceResponse,
};
pub use queue::{BoundedQueue, RetryPolicy, RetryStats, TaskHandle};
pub use runtime::{PlexusRuntime, PlexusRuntimeBuilder};
pub use settings::{RuntimeSettings, SettingsStore};
pub use system::{CurrentLoad, ResourcesInfo, SystemMonitor};
