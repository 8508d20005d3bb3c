//! Builder for configuring PlexusRuntime initialization.

use super::PlexusRuntime;
use crate::backend::{BackendConfig, BackendController};
use crate::bridge::EventBus;
use crate::config::{NetworkConfig, PathsConfig};
use crate::dispatch::{Dispatcher, ServiceRegistry};
use crate::error::{PlexusError, Result};
use crate::extension::builtin::{builtin_loader, BuiltinDeps};
use crate::extension::{ExtensionLoader, ExtensionRegistry};
use crate::network::{DownloadManager, DownloadSource, HttpSource};
use crate::queue::BoundedQueue;
use crate::settings::SettingsStore;
use crate::system::SystemMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Builder for [`PlexusRuntime`].
///
/// # Example
///
/// ```rust,ignore
/// use plexus_core::{BackendConfig, PlexusRuntime};
///
/// let runtime = PlexusRuntime::builder("/var/lib/plexus")
///     .with_backend(BackendConfig::new("/opt/nitro/nitro"))
///     .build()?;
/// runtime.init().await?;
/// runtime.load().await?;
/// ```
pub struct PlexusRuntimeBuilder {
    data_dir: PathBuf,
    loader: Option<Arc<dyn ExtensionLoader>>,
    download_source: Option<Arc<dyn DownloadSource>>,
    backend: Option<BackendConfig>,
    queue_limits: Vec<(String, usize)>,
    progress_interval: Duration,
}

impl PlexusRuntimeBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            loader: None,
            download_source: None,
            backend: None,
            queue_limits: Vec::new(),
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    /// Replace the built-in loader. Built-in extensions are then whatever
    /// `loader.builtin_manifests()` reports.
    pub fn with_loader(mut self, loader: Arc<dyn ExtensionLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Transport for downloads. Default: HTTP via reqwest.
    pub fn with_download_source(mut self, source: Arc<dyn DownloadSource>) -> Self {
        self.download_source = Some(source);
        self
    }

    /// Enable the built-in inference extension.
    pub fn with_backend(mut self, config: BackendConfig) -> Self {
        self.backend = Some(config);
        self
    }

    /// Concurrency limit of a queue class, applied before first use.
    pub fn with_queue_limit(mut self, class: impl Into<String>, limit: usize) -> Self {
        self.queue_limits.push((class.into(), limit));
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Create the data directory layout and wire every component. Nothing
    /// is scanned or loaded until `init()` / `load()`.
    pub fn build(self) -> Result<PlexusRuntime> {
        let extensions_dir = self.data_dir.join(PathsConfig::EXTENSIONS_DIR_NAME);
        for dir in [
            self.data_dir.clone(),
            extensions_dir.clone(),
            self.data_dir.join(PathsConfig::THREADS_DIR_NAME),
            self.data_dir.join(PathsConfig::MODELS_DIR_NAME),
            self.data_dir.join(PathsConfig::LOGS_DIR_NAME),
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| PlexusError::Io {
                    message: format!("Failed to create directory: {}", dir.display()),
                    path: Some(dir.clone()),
                    source: Some(e),
                })?;
            }
        }

        let events = EventBus::new();
        let queue = BoundedQueue::new();
        for (class, limit) in &self.queue_limits {
            queue.set_limit(class, *limit)?;
        }

        let source = match self.download_source {
            Some(source) => source,
            None => Arc::new(HttpSource::new()?),
        };
        let downloads =
            DownloadManager::new(source, events.clone()).with_progress_interval(self.progress_interval);

        let monitor = SystemMonitor::new(queue.clone());
        let backend = self
            .backend
            .map(|config| BackendController::new(config, queue.clone()))
            .transpose()?;

        let services = Arc::new(ServiceRegistry::new());
        let settings = Arc::new(SettingsStore::load(
            self.data_dir.join(PathsConfig::SETTINGS_FILE_NAME),
            events.clone(),
        ));

        let loader: Arc<dyn ExtensionLoader> = match self.loader {
            Some(loader) => loader,
            None => Arc::new(builtin_loader(BuiltinDeps {
                data_dir: self.data_dir.clone(),
                monitor: monitor.clone(),
                downloads: downloads.clone(),
                backend: backend.clone(),
            })?),
        };
        debug!("{} built-in extensions", loader.builtin_manifests().len());

        let registry = ExtensionRegistry::new(
            extensions_dir,
            self.data_dir.clone(),
            loader,
            services.clone(),
            settings.clone(),
        );

        info!("Plexus runtime ready at {}", self.data_dir.display());
        Ok(PlexusRuntime {
            data_dir: self.data_dir,
            events,
            queue,
            downloads,
            dispatcher: Dispatcher::new(services),
            settings,
            registry,
            monitor,
            backend,
        })
    }
}
