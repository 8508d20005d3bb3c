//! Resolving entrypoints to live extensions.
//!
//! The registry never loads code itself. It hands each record to an
//! [`ExtensionLoader`], which turns the manifest's entrypoint into an
//! [`Extension`] object. [`BuiltinLoader`] serves `builtin:<id>` entrypoints
//! from factories compiled into the runtime.

use super::manifest::{ActivationPoint, ExtensionManifest, ExtensionRecord};
use crate::dispatch::{ServiceHandler, ServiceName, ServiceRegistry};
use crate::error::{PlexusError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Entrypoint scheme for extensions compiled into the runtime.
pub const BUILTIN_SCHEME: &str = "builtin:";

/// What an extension sees while its hooks run.
pub struct ExtensionContext {
    name: String,
    services: Arc<ServiceRegistry>,
    data_dir: PathBuf,
}

impl ExtensionContext {
    pub fn new(name: impl Into<String>, services: Arc<ServiceRegistry>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            services,
            data_dir: data_dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Register `handler` for `service`, owned by this extension. Removed
    /// automatically when the extension unloads or fails to load.
    pub fn register(&self, service: ServiceName, handler: Arc<dyn ServiceHandler>) {
        self.services.register(service, &self.name, handler);
    }
}

/// A resolved extension.
///
/// A hook only runs when the manifest lists the activation point *and*
/// [`Extension::implements`] returns true for it.
#[async_trait]
pub trait Extension: Send + Sync {
    fn implements(&self, _point: ActivationPoint) -> bool {
        false
    }

    async fn on_load(&self, _ctx: &ExtensionContext) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _ctx: &ExtensionContext) -> Result<()> {
        Ok(())
    }
}

/// Turns catalog records into extension objects.
#[async_trait]
pub trait ExtensionLoader: Send + Sync {
    async fn resolve(&self, record: &ExtensionRecord) -> Result<Arc<dyn Extension>>;

    /// Extensions that ship with the loader, registered ahead of packages.
    fn builtin_manifests(&self) -> Vec<ExtensionManifest> {
        Vec::new()
    }
}

type Factory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// Loader for `builtin:<id>` entrypoints.
///
/// Packaged extensions may point at a built-in id too; they then share the
/// built-in implementation under their own name.
#[derive(Default, Clone)]
pub struct BuiltinLoader {
    factories: HashMap<String, Factory>,
    manifests: Vec<ExtensionManifest>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` resolvable without listing it as a built-in extension.
    pub fn with_factory<F>(mut self, id: &str, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Arc::new(factory));
        self
    }

    /// Ship `manifest` as a built-in extension backed by `factory`. The
    /// manifest's entrypoint must be `builtin:<id>`.
    pub fn with_builtin<F>(mut self, manifest: ExtensionManifest, factory: F) -> Result<Self>
    where
        F: Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
    {
        let id = builtin_id(&manifest.entrypoint).ok_or_else(|| PlexusError::InvalidManifest {
            message: format!(
                "built-in {} has entrypoint '{}', expected {}<id>",
                manifest.name, manifest.entrypoint, BUILTIN_SCHEME
            ),
        })?;
        manifest.validate()?;
        self.factories.insert(id.to_string(), Arc::new(factory));
        self.manifests.push(manifest);
        Ok(self)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn builtin_id(entrypoint: &str) -> Option<&str> {
    entrypoint
        .strip_prefix(BUILTIN_SCHEME)
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl ExtensionLoader for BuiltinLoader {
    async fn resolve(&self, record: &ExtensionRecord) -> Result<Arc<dyn Extension>> {
        let factory = builtin_id(&record.entrypoint)
            .and_then(|id| self.factories.get(id))
            .ok_or_else(|| PlexusError::ActivationFailed {
                name: record.name.clone(),
                message: format!("cannot resolve entrypoint '{}'", record.entrypoint),
            })?;

        debug!("Resolved {} via {}", record.name, record.entrypoint);
        Ok(factory())
    }

    fn builtin_manifests(&self) -> Vec<ExtensionManifest> {
        self.manifests.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{CapabilityType, InstallationState};

    struct Noop;
    impl Extension for Noop {}

    fn manifest(entrypoint: &str) -> ExtensionManifest {
        ExtensionManifest {
            name: "@plexus/noop".into(),
            version: "1.0.0".into(),
            description: None,
            entrypoint: entrypoint.into(),
            capability_type: Some(CapabilityType::Model),
            activation_points: vec![],
        }
    }

    #[tokio::test]
    async fn test_resolves_registered_builtin() {
        let loader = BuiltinLoader::new()
            .with_builtin(manifest("builtin:noop"), || Arc::new(Noop))
            .unwrap();
        assert_eq!(loader.builtin_manifests().len(), 1);

        let record = ExtensionRecord::from_manifest(&manifest("builtin:noop"), InstallationState::NotRequired, None);
        let ext = loader.resolve(&record).await.unwrap();
        assert!(!ext.implements(ActivationPoint::OnLoad));
    }

    #[tokio::test]
    async fn test_unknown_entrypoint_fails_activation() {
        let loader = BuiltinLoader::new().with_factory("noop", || Arc::new(Noop));
        assert!(loader.builtin_manifests().is_empty());

        for entrypoint in ["builtin:missing", "dist/index.js", "builtin:"] {
            let record = ExtensionRecord::from_manifest(&manifest(entrypoint), InstallationState::Installed, None);
            assert!(matches!(
                loader.resolve(&record).await,
                Err(PlexusError::ActivationFailed { .. })
            ));
        }
    }

    #[test]
    fn test_builtin_requires_builtin_scheme() {
        assert!(BuiltinLoader::new()
            .with_builtin(manifest("dist/index.js"), || Arc::new(Noop))
            .is_err());
    }

    #[test]
    fn test_context_registers_under_own_name() {
        let services = Arc::new(ServiceRegistry::new());
        let ctx = ExtensionContext::new("ext-a", services.clone(), "/tmp");
        ctx.register(
            ServiceName::DownloadAbort,
            crate::dispatch::handler_fn(|_| async { Ok(serde_json::Value::Null) }),
        );
        assert_eq!(services.registrations(ServiceName::DownloadAbort)[0].owner, "ext-a");
    }
}
