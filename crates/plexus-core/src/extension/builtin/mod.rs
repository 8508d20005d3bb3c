//! Extensions compiled into the runtime.
//!
//! | name | entrypoint | capability |
//! |------|------------|------------|
//! | `@plexus/conversational-extension` | `builtin:conversational` | conversational |
//! | `@plexus/monitoring-extension` | `builtin:monitoring` | systemMonitoring |
//! | `@plexus/inference-extension` | `builtin:inference` | inference |
//! | `@plexus/model-extension` | `builtin:model` | model |
//! | `@plexus/download-extension` | `builtin:download` | none |
//!
//! The inference extension is only shipped when a backend is configured.

mod conversational;
mod download;
mod inference;
mod model;
mod monitoring;

pub use conversational::{
    ConversationalExtension, MessageRole, NewMessage, NewThread, Thread, ThreadMessage, ThreadStore,
};
pub use download::DownloadExtension;
pub use inference::InferenceExtension;
pub use model::{ModelExtension, ModelInfo, ModelSource, ModelStore};
pub use monitoring::MonitoringExtension;

use super::loader::{BuiltinLoader, Extension};
use super::manifest::{ActivationPoint, CapabilityType, ExtensionManifest};
use crate::backend::BackendController;
use crate::dispatch::ServiceName;
use crate::error::{PlexusError, Result};
use crate::network::DownloadManager;
use crate::system::SystemMonitor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub const CONVERSATIONAL_EXTENSION: &str = "@plexus/conversational-extension";
pub const MONITORING_EXTENSION: &str = "@plexus/monitoring-extension";
pub const INFERENCE_EXTENSION: &str = "@plexus/inference-extension";
pub const MODEL_EXTENSION: &str = "@plexus/model-extension";
pub const DOWNLOAD_EXTENSION: &str = "@plexus/download-extension";

/// Shared components the built-ins are wired to.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub data_dir: PathBuf,
    pub monitor: SystemMonitor,
    pub downloads: DownloadManager,
    pub backend: Option<BackendController>,
}

/// Loader serving every built-in.
pub fn builtin_loader(deps: BuiltinDeps) -> Result<BuiltinLoader> {
    let data_dir = deps.data_dir.clone();
    let mut loader = BuiltinLoader::new()
        .with_builtin(
            manifest(
                CONVERSATIONAL_EXTENSION,
                "conversational",
                "Conversation threads stored as JSON files",
                Some(CapabilityType::Conversational),
            ),
            move || -> Arc<dyn Extension> { Arc::new(ConversationalExtension::new(&data_dir)) },
        )?
        .with_builtin(
            manifest(
                MONITORING_EXTENSION,
                "monitoring",
                "CPU and memory usage of this machine",
                Some(CapabilityType::SystemMonitoring),
            ),
            {
                let monitor = deps.monitor.clone();
                move || -> Arc<dyn Extension> { Arc::new(MonitoringExtension::new(monitor.clone())) }
            },
        )?;

    if let Some(backend) = deps.backend.clone() {
        loader = loader.with_builtin(
            manifest(
                INFERENCE_EXTENSION,
                "inference",
                "Local model-serving backend",
                Some(CapabilityType::Inference),
            ),
            move || -> Arc<dyn Extension> { Arc::new(InferenceExtension::new(backend.clone())) },
        )?;
    }

    let (model_dir, downloads) = (deps.data_dir.clone(), deps.downloads.clone());
    loader = loader.with_builtin(
        manifest(
            MODEL_EXTENSION,
            "model",
            "Model metadata and downloads under the models directory",
            Some(CapabilityType::Model),
        ),
        move || -> Arc<dyn Extension> { Arc::new(ModelExtension::new(&model_dir, downloads.clone())) },
    )?;

    let downloads = deps.downloads.clone();
    loader.with_builtin(
        manifest(DOWNLOAD_EXTENSION, "download", "File downloads with progress events", None),
        move || -> Arc<dyn Extension> { Arc::new(DownloadExtension::new(downloads.clone())) },
    )
}

fn manifest(
    name: &str,
    id: &str,
    description: &str,
    capability_type: Option<CapabilityType>,
) -> ExtensionManifest {
    ExtensionManifest {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: Some(description.to_string()),
        entrypoint: format!("{}{}", super::loader::BUILTIN_SCHEME, id),
        capability_type,
        activation_points: vec![ActivationPoint::OnLoad, ActivationPoint::OnUnload],
    }
}

/// Decode service arguments; `null` counts as `{}`.
pub(crate) fn parse_args<T: DeserializeOwned>(service: ServiceName, args: Value) -> Result<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| PlexusError::InvalidParams {
        message: format!("{}: {}", service, e),
    })
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run file work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PlexusError::Other(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EventBus;
    use crate::extension::ExtensionLoader;
    use crate::queue::BoundedQueue;
    use serde::Deserialize;

    fn deps(backend: Option<BackendController>) -> BuiltinDeps {
        let queue = BoundedQueue::new();
        BuiltinDeps {
            data_dir: std::env::temp_dir(),
            monitor: SystemMonitor::new(queue.clone()),
            downloads: DownloadManager::with_http(EventBus::new()).unwrap(),
            backend,
        }
    }

    #[tokio::test]
    async fn test_builtin_manifests() {
        let loader = builtin_loader(deps(None)).unwrap();
        let names: Vec<_> = loader.builtin_manifests().into_iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                CONVERSATIONAL_EXTENSION,
                MONITORING_EXTENSION,
                MODEL_EXTENSION,
                DOWNLOAD_EXTENSION
            ]
        );

        let backend = BackendController::new(
            crate::backend::BackendConfig::new("/bin/false"),
            BoundedQueue::new(),
        )
        .unwrap();
        let loader = builtin_loader(deps(Some(backend))).unwrap();
        assert_eq!(loader.builtin_manifests().len(), 5);
        assert!(loader.ids().contains(&"inference".to_string()));
    }

    #[test]
    fn test_parse_args() {
        #[derive(Debug, Deserialize)]
        struct Args {
            #[serde(default)]
            title: Option<String>,
        }

        let args: Args = parse_args(ServiceName::CreateConversation, Value::Null).unwrap();
        assert!(args.title.is_none());

        let err = parse_args::<Args>(ServiceName::CreateConversation, serde_json::json!(5)).unwrap_err();
        assert!(matches!(err, PlexusError::InvalidParams { .. }));
        assert!(err.to_string().contains("CreateConversation"));
    }
}
