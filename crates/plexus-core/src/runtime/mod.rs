//! The runtime facade: one owned object wiring every component together.

mod bridge;
mod builder;

pub use builder::PlexusRuntimeBuilder;

use crate::backend::BackendController;
use crate::bridge::EventBus;
use crate::dispatch::{DispatchOutcome, Dispatcher, ServiceName};
use crate::error::Result;
use crate::extension::{ExtensionRecord, ExtensionRegistry, InstallReport};
use crate::network::DownloadManager;
use crate::queue::BoundedQueue;
use crate::settings::SettingsStore;
use crate::system::SystemMonitor;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the catalog, service registry, download manager, queue, settings
/// and event bus.
///
/// Lifecycle: [`init`](Self::init) scans the extensions,
/// [`load`](Self::load) activates them, [`unload`](Self::unload) deactivates
/// them and [`teardown`](Self::teardown) additionally stops downloads and
/// the backend.
pub struct PlexusRuntime {
    data_dir: PathBuf,
    events: EventBus,
    queue: BoundedQueue,
    downloads: DownloadManager,
    dispatcher: Dispatcher,
    settings: Arc<SettingsStore>,
    registry: ExtensionRegistry,
    monitor: SystemMonitor,
    backend: Option<BackendController>,
}

impl PlexusRuntime {
    pub fn builder(data_dir: impl Into<PathBuf>) -> PlexusRuntimeBuilder {
        PlexusRuntimeBuilder::new(data_dir)
    }

    /// Runtime with defaults rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(data_dir).build()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &BoundedQueue {
        &self.queue
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &SystemMonitor {
        &self.monitor
    }

    pub fn backend(&self) -> Option<&BackendController> {
        self.backend.as_ref()
    }

    /// Build the extension catalog. Returns the number of known extensions.
    pub async fn init(&self) -> Result<usize> {
        self.registry.register_active().await
    }

    /// Activate extensions. Returns the active records.
    pub async fn load(&self) -> Result<Vec<ExtensionRecord>> {
        let active = self.registry.load().await?;
        info!("{} extensions active", active.len());
        Ok(active)
    }

    pub async fn unload(&self) -> Result<()> {
        self.registry.unload().await
    }

    /// Unload everything, abort live downloads and stop the backend.
    pub async fn teardown(&self) -> Result<()> {
        self.unload().await?;
        self.downloads.abort_all();
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.stop().await {
                warn!("Failed to stop backend during teardown: {}", e);
            }
        }
        info!("Plexus runtime torn down");
        Ok(())
    }

    /// Install packages. New records are appended to the catalog and become
    /// eligible on the next `load()`.
    pub async fn install(&self, package_paths: &[PathBuf]) -> Vec<InstallReport> {
        self.registry.install(package_paths).await
    }

    pub async fn execute(&self, service: ServiceName, args: Value) -> Result<DispatchOutcome> {
        self.dispatcher.execute(service, args).await
    }

    pub async fn execute_serial(&self, service: ServiceName, args: Value) -> Result<DispatchOutcome> {
        self.dispatcher.execute_serial(service, args).await
    }
}
