//! Extension catalog and lifecycle.
//!
//! The catalog lists every known extension in registration order: built-ins
//! first, then package folders sorted by name, then packages installed
//! during this run. `load()` activates one extension per capability type
//! plus every capability-less one; hooks run outside the catalog lock.

use super::installer::{self, STAGING_PREFIX};
use super::loader::{Extension, ExtensionContext, ExtensionLoader};
use super::manifest::{
    ActivationPoint, CapabilityType, ExtensionManifest, ExtensionRecord, InstallReport,
    InstallationState,
};
use crate::dispatch::ServiceRegistry;
use crate::error::{PlexusError, Result};
use crate::settings::{RuntimeSettings, SettingsStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct ExtensionRegistry {
    extensions_dir: PathBuf,
    data_dir: PathBuf,
    catalog: RwLock<Vec<ExtensionRecord>>,
    instances: Mutex<HashMap<String, Arc<dyn Extension>>>,
    loader: Arc<dyn ExtensionLoader>,
    services: Arc<ServiceRegistry>,
    settings: Arc<SettingsStore>,
    /// Serializes load, unload, install and uninstall.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ExtensionRegistry {
    pub fn new(
        extensions_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        loader: Arc<dyn ExtensionLoader>,
        services: Arc<ServiceRegistry>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            data_dir: data_dir.into(),
            catalog: RwLock::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            loader,
            services,
            settings,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.extensions_dir
    }

    /// Rebuild the catalog from the built-ins and the extensions directory.
    ///
    /// Returns the number of records. Extensions that are currently active
    /// keep their active flag.
    pub async fn register_active(&self) -> Result<usize> {
        let _guard = self.lifecycle.lock().await;
        let settings = self.settings.snapshot().await;

        let mut records: Vec<ExtensionRecord> = Vec::new();
        for manifest in self.loader.builtin_manifests() {
            push_unique(
                &mut records,
                record_for(&manifest, InstallationState::NotRequired, None, &settings),
            );
        }

        let extensions_dir = self.extensions_dir.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            package_dirs(&extensions_dir).map(|dirs| {
                dirs.into_iter()
                    .map(|dir| {
                        let manifest = ExtensionManifest::read_from(&dir);
                        (dir, manifest)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(|e| PlexusError::Other(format!("extension scan failed: {}", e)))??;

        for (dir, manifest) in scanned {
            let record = match manifest {
                Ok(manifest) => record_for(&manifest, InstallationState::Installed, Some(dir), &settings),
                Err(e) => {
                    let folder = dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    warn!("Extension folder {} is unusable: {}", dir.display(), e);
                    ExtensionRecord::corrupted(&folder, dir, e.to_string())
                }
            };
            push_unique(&mut records, record);
        }

        let active = self.active_names();
        for record in &mut records {
            record.active = active.contains_key(&record.name);
        }

        let count = records.len();
        *self.catalog.write().await = records;
        info!("Registered {} extensions", count);
        Ok(count)
    }

    /// Activate the winning extension of every capability type and every
    /// capability-less extension. Extensions that lost their slot since the
    /// last load are unloaded first.
    ///
    /// Returns the active records afterwards.
    pub async fn load(&self) -> Result<Vec<ExtensionRecord>> {
        let _guard = self.lifecycle.lock().await;
        let snapshot = self.catalog.read().await.clone();
        let settings = self.settings.snapshot().await;
        let targets = select_targets(&snapshot, &settings);

        for record in snapshot.iter().rev() {
            if record.active && !targets.contains(&record.name) {
                info!("Unloading {}: no longer selected", record.name);
                self.deactivate(record).await;
            }
        }

        for record in &snapshot {
            if targets.contains(&record.name) && !record.active {
                self.activate(record).await;
            }
        }

        Ok(self.active().await)
    }

    /// Run `onUnload` for every active extension, newest first, and drop
    /// their service registrations.
    pub async fn unload(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let snapshot = self.catalog.read().await.clone();
        for record in snapshot.iter().rev().filter(|r| r.active) {
            self.deactivate(record).await;
        }
        Ok(())
    }

    /// The active extension for `capability`.
    pub async fn get(&self, capability: CapabilityType) -> Option<ExtensionRecord> {
        self.catalog
            .read()
            .await
            .iter()
            .find(|r| r.active && r.capability_type == Some(capability))
            .cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<ExtensionRecord> {
        self.catalog.read().await.iter().find(|r| r.name == name).cloned()
    }

    pub async fn list(&self) -> Vec<ExtensionRecord> {
        self.catalog.read().await.clone()
    }

    pub async fn active(&self) -> Vec<ExtensionRecord> {
        self.catalog
            .read()
            .await
            .iter()
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    /// Persist `name` as the explicit choice for `capability`. Takes effect
    /// on the next `load()`.
    pub async fn set_active(&self, capability: CapabilityType, name: &str) -> Result<RuntimeSettings> {
        let record = self
            .get_by_name(name)
            .await
            .ok_or_else(|| PlexusError::ExtensionNotFound { name: name.to_string() })?;

        if record.capability_type != Some(capability) {
            return Err(PlexusError::Validation {
                field: "capabilityType".into(),
                message: format!("{} does not provide capability {}", name, capability),
            });
        }
        if !record.is_loadable() {
            return Err(PlexusError::Validation {
                field: "name".into(),
                message: format!("{} is {:?}", name, record.installation_state),
            });
        }

        self.settings.set_active(capability, name).await
    }

    /// Enable or disable an inactive extension. Disabled extensions stay in
    /// the catalog as `NotInstalled` and are skipped by `load()`.
    pub async fn set_disabled(&self, name: &str, disabled: bool) -> Result<RuntimeSettings> {
        let _guard = self.lifecycle.lock().await;
        let mut catalog = self.catalog.write().await;
        let record = catalog
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| PlexusError::ExtensionNotFound { name: name.to_string() })?;

        if record.active {
            return Err(PlexusError::Validation {
                field: "name".into(),
                message: format!("{} is active; unload it first", name),
            });
        }
        if record.installation_state == InstallationState::Corrupted {
            return Err(PlexusError::Validation {
                field: "name".into(),
                message: format!("{} is corrupted", name),
            });
        }

        record.installation_state = match (disabled, &record.path) {
            (true, _) => InstallationState::NotInstalled,
            (false, Some(_)) => InstallationState::Installed,
            (false, None) => InstallationState::NotRequired,
        };
        drop(catalog);

        self.settings.set_disabled(name, disabled).await
    }

    /// Install each package. One report per input path; a failing package
    /// never aborts the batch.
    pub async fn install(&self, package_paths: &[PathBuf]) -> Vec<InstallReport> {
        let _guard = self.lifecycle.lock().await;
        let mut reports = Vec::with_capacity(package_paths.len());

        for path in package_paths {
            let report = match self.install_one(path).await {
                Ok(manifest) => InstallReport {
                    name: manifest.name,
                    installation_state: InstallationState::Installed,
                    error_message: None,
                },
                Err((name, e)) => {
                    warn!("Failed to install {}: {}", path.display(), e);
                    InstallReport {
                        name,
                        installation_state: InstallationState::NotInstalled,
                        error_message: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    async fn install_one(&self, path: &Path) -> std::result::Result<ExtensionManifest, (String, PlexusError)> {
        let stem = installer::package_stem(path);

        let (package, dir) = (path.to_path_buf(), self.extensions_dir.clone());
        let staged = tokio::task::spawn_blocking(move || installer::stage(&package, &dir))
            .await
            .map_err(|e| (stem.clone(), PlexusError::Other(format!("install task failed: {}", e))))?
            .map_err(|e| (stem.clone(), e))?;
        let name = staged.manifest.name.clone();
        let target = self.extensions_dir.join(staged.manifest.folder_name());

        let previous = self.get_by_name(&name).await;
        if let Some(existing) = &previous {
            let refusal = if existing.installation_state == InstallationState::NotRequired {
                Some("name is taken by a built-in extension".to_string())
            } else if existing.active {
                Some("extension is active; unload it first".to_string())
            } else {
                None
            };
            if let Some(message) = refusal {
                return Err((name, PlexusError::InstallationFailed { message }));
            }
        }
        if let Some(owner) = self.folder_owner(&target, &name).await {
            return Err((
                name,
                PlexusError::InstallationFailed {
                    message: format!("folder {} belongs to {}", target.display(), owner),
                },
            ));
        }

        self.upsert(ExtensionRecord::from_manifest(
            &staged.manifest,
            InstallationState::Installing,
            None,
        ))
        .await;

        let dir = self.extensions_dir.clone();
        let committed = tokio::task::spawn_blocking(move || installer::commit(staged, &dir))
            .await
            .map_err(|e| PlexusError::Other(format!("install task failed: {}", e)))
            .and_then(|r| r);

        match committed {
            Ok((manifest, target)) => {
                let settings = self.settings.snapshot().await;
                self.upsert(record_for(&manifest, InstallationState::Installed, Some(target), &settings))
                    .await;
                Ok(manifest)
            }
            Err(e) => {
                match previous {
                    Some(record) => self.upsert(record).await,
                    None => self.catalog.write().await.retain(|r| r.name != name),
                }
                Err((name, e))
            }
        }
    }

    /// Name of another record installed at `folder`.
    async fn folder_owner(&self, folder: &Path, name: &str) -> Option<String> {
        self.catalog
            .read()
            .await
            .iter()
            .find(|r| r.name != name && r.path.as_deref() == Some(folder))
            .map(|r| r.name.clone())
    }

    /// Remove an inactive, packaged extension from disk and from the
    /// catalog, and forget any settings that reference it.
    pub async fn uninstall(&self, name: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let record = self
            .get_by_name(name)
            .await
            .ok_or_else(|| PlexusError::ExtensionNotFound { name: name.to_string() })?;

        if record.active {
            return Err(PlexusError::Validation {
                field: "name".into(),
                message: format!("{} is active; unload it first", name),
            });
        }
        let Some(path) = record.path.clone() else {
            return Err(PlexusError::UnsupportedOperation(format!(
                "{} is built in and cannot be uninstalled",
                name
            )));
        };

        tokio::task::spawn_blocking(move || {
            if path.exists() {
                std::fs::remove_dir_all(&path).map_err(|e| PlexusError::io_with_path(e, &path))?;
            }
            Ok::<_, PlexusError>(())
        })
        .await
        .map_err(|e| PlexusError::Other(format!("uninstall task failed: {}", e)))??;
        self.catalog.write().await.retain(|r| r.name != name);
        self.settings.forget_extension(name).await?;

        info!("Uninstalled {}", name);
        Ok(())
    }

    async fn activate(&self, record: &ExtensionRecord) {
        let ctx = self.context(&record.name);
        let result = async {
            let extension = self.loader.resolve(record).await?;
            if record.declares(ActivationPoint::OnLoad) && extension.implements(ActivationPoint::OnLoad) {
                extension.on_load(&ctx).await?;
            } else {
                debug!("Skipping onLoad for {}", record.name);
            }
            Ok::<_, PlexusError>(extension)
        }
        .await;

        match result {
            Ok(extension) => {
                self.lock_instances().insert(record.name.clone(), extension);
                if let Some(capability) = record.capability_type {
                    self.services.set_provider(capability, &record.name);
                }
                self.update_record(&record.name, |r| {
                    r.active = true;
                    r.error = None;
                })
                .await;
                info!("Loaded extension {} {}", record.name, record.version);
            }
            Err(e) => {
                self.services.remove_owner(&record.name);
                warn!("Failed to load extension {}: {}", record.name, e);
                let message = e.to_string();
                self.update_record(&record.name, |r| {
                    r.active = false;
                    r.error = Some(message);
                })
                .await;
            }
        }
    }

    async fn deactivate(&self, record: &ExtensionRecord) {
        let extension = self.lock_instances().remove(&record.name);
        if let Some(extension) = extension {
            if record.declares(ActivationPoint::OnUnload) && extension.implements(ActivationPoint::OnUnload) {
                if let Err(e) = extension.on_unload(&self.context(&record.name)).await {
                    warn!("onUnload of {} failed: {}", record.name, e);
                }
            } else {
                debug!("Skipping onUnload for {}", record.name);
            }
        }

        let removed = self.services.remove_owner(&record.name);
        debug!("Removed {} service registrations of {}", removed, record.name);
        self.update_record(&record.name, |r| r.active = false).await;
        info!("Unloaded extension {}", record.name);
    }

    fn context(&self, name: &str) -> ExtensionContext {
        ExtensionContext::new(name, self.services.clone(), self.data_dir.clone())
    }

    fn active_names(&self) -> HashMap<String, Arc<dyn Extension>> {
        self.lock_instances().clone()
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Extension>>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn update_record<F: FnOnce(&mut ExtensionRecord)>(&self, name: &str, change: F) {
        if let Some(record) = self.catalog.write().await.iter_mut().find(|r| r.name == name) {
            change(record);
        }
    }

    /// Replace the record with the same name in place, or append it.
    async fn upsert(&self, record: ExtensionRecord) {
        let mut catalog = self.catalog.write().await;
        match catalog.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => catalog.push(record),
        }
    }

}

/// Package folders under `extensions_dir`, sorted by name.
fn package_dirs(extensions_dir: &Path) -> Result<Vec<PathBuf>> {
    if !extensions_dir.exists() {
        std::fs::create_dir_all(extensions_dir).map_err(|e| PlexusError::io_with_path(e, extensions_dir))?;
    }

    let mut dirs: Vec<PathBuf> = std::fs::read_dir(extensions_dir)
        .map_err(|e| PlexusError::io_with_path(e, extensions_dir))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            !name.starts_with('.') && !name.starts_with(STAGING_PREFIX)
        })
        .map(|e| e.path())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn record_for(
    manifest: &ExtensionManifest,
    state: InstallationState,
    path: Option<PathBuf>,
    settings: &RuntimeSettings,
) -> ExtensionRecord {
    let state = if settings.disabled_extensions.contains(&manifest.name) {
        InstallationState::NotInstalled
    } else {
        state
    };
    ExtensionRecord::from_manifest(manifest, state, path)
}

fn push_unique(records: &mut Vec<ExtensionRecord>, record: ExtensionRecord) {
    if records.iter().any(|r| r.name == record.name) {
        warn!("Duplicate extension {} ignored", record.name);
        return;
    }
    records.push(record);
}

/// Names that should be active: per capability the settings selection if it
/// is loadable, else the last loadable registration; plus every loadable
/// extension without a capability.
fn select_targets(records: &[ExtensionRecord], settings: &RuntimeSettings) -> Vec<String> {
    let mut targets = Vec::new();

    for capability in CapabilityType::ALL {
        let candidates: Vec<&ExtensionRecord> = records
            .iter()
            .filter(|r| r.is_loadable() && r.capability_type == Some(capability))
            .collect();

        let selected = settings
            .active_extensions
            .get(&capability)
            .and_then(|name| candidates.iter().find(|r| &r.name == name));
        if let Some(winner) = selected.or(candidates.last()) {
            targets.push(winner.name.clone());
        }
    }

    targets.extend(
        records
            .iter()
            .filter(|r| r.is_loadable() && r.capability_type.is_none())
            .map(|r| r.name.clone()),
    );
    targets
}
