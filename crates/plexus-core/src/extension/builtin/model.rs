//! Model folders under `<data_dir>/models/`.
//!
//! Each model lives in `<models>/<model id>/`: `model.json` holds its
//! metadata, the binaries sit next to it. Transfers go through the shared
//! download manager under keys of the form `<model id>/<file name>`.

use super::{parse_args, run_blocking, to_json};
use crate::atomic::{atomic_read_json, atomic_write_json};
use crate::config::PathsConfig;
use crate::dispatch::{handler_fn, ServiceName};
use crate::error::{PlexusError, Result};
use crate::extension::manifest::is_single_component;
use crate::extension::{ActivationPoint, Extension, ExtensionContext};
use crate::network::{DownloadManager, DownloadRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Engines that run a binary from the model folder.
const LOCAL_ENGINES: &[&str] = &["nitro", "llama-cpp"];
const PARTIAL_SUFFIX: &str = ".download";
const BINARY_MARKER: &str = ".gguf";
/// Reserved folder name under the models directory.
const CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Expected hex SHA-256 of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, alias = "source")]
    pub sources: Vec<ModelSource>,
    /// Everything else in `model.json`, kept as written.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ModelInfo {
    /// Remote engines have nothing to download.
    pub fn runs_locally(&self) -> bool {
        self.engine
            .as_deref()
            .map_or(true, |engine| LOCAL_ENGINES.contains(&engine))
    }

    /// `(url, file name)` for every source.
    ///
    /// A single source is saved under its url's last segment when that names
    /// a `.gguf` file, under the model id otherwise.
    fn files(&self) -> Result<Vec<(&ModelSource, String)>> {
        let single = self.sources.len() == 1;
        let mut files = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let last_segment = url::Url::parse(&source.url)
                .ok()
                .and_then(|url| url.path_segments()?.last().map(str::to_string))
                .filter(|segment| !segment.is_empty());
            let name = match (&source.filename, last_segment) {
                (Some(filename), _) => filename.clone(),
                (None, Some(segment)) if !single || segment.to_lowercase().ends_with(BINARY_MARKER) => segment,
                _ => self.id.clone(),
            };
            if !is_single_component(&name) || name == PathsConfig::MODEL_METADATA_FILE_NAME {
                return Err(PlexusError::InvalidParams {
                    message: format!("model {} cannot save a file as '{}'", self.id, name),
                });
            }
            files.push((source, name));
        }
        Ok(files)
    }

    /// Upgrade metadata written with a lone `source_url`.
    fn migrate_legacy_source(&mut self) {
        if !self.sources.is_empty() {
            return;
        }
        if let Some(Value::String(url)) = self.extra.remove("source_url") {
            self.sources.push(ModelSource {
                url,
                filename: Some(self.id.clone()),
                sha256: None,
            });
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelRef {
    #[serde(alias = "id")]
    model_id: String,
}

#[derive(Debug, Deserialize)]
struct ModelArgs {
    model: ModelInfo,
}

/// Model metadata and binaries on disk.
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, id: &str) -> Result<PathBuf> {
        disk::model_dir(&self.root, id)
    }

    pub async fn save(&self, model: ModelInfo) -> Result<ModelInfo> {
        let root = self.root.clone();
        run_blocking(move || disk::save(&root, model)).await
    }

    /// Every folder with metadata, ordered by id.
    pub async fn list(&self) -> Result<Vec<ModelInfo>> {
        let root = self.root.clone();
        run_blocking(move || disk::list(&root, false)).await
    }

    /// Models ready to run: remote ones, and local ones with a binary.
    pub async fn list_downloaded(&self) -> Result<Vec<ModelInfo>> {
        let root = self.root.clone();
        run_blocking(move || disk::list(&root, true)).await
    }

    /// Remove the binaries of `id`, keeping its metadata.
    pub async fn delete(&self, id: &str) -> Result<usize> {
        let (root, id) = (self.root.clone(), id.to_string());
        run_blocking(move || disk::delete(&root, &id)).await
    }
}

/// Blocking file operations behind [`ModelStore`].
mod disk {
    use super::*;

    pub(super) fn model_dir(root: &Path, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id != CONFIG_DIR
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PlexusError::InvalidParams {
                message: format!("invalid model id '{}'", id),
            });
        }
        Ok(root.join(id))
    }

    pub(super) fn save(root: &Path, model: ModelInfo) -> Result<ModelInfo> {
        let dir = model_dir(root, &model.id)?;
        fs::create_dir_all(&dir).map_err(|e| PlexusError::io_with_path(e, &dir))?;
        atomic_write_json(&dir.join(PathsConfig::MODEL_METADATA_FILE_NAME), &model, false)?;
        debug!("Saved metadata for model {}", model.id);
        Ok(model)
    }

    pub(super) fn read(dir: &Path) -> Result<Option<ModelInfo>> {
        let mut model = atomic_read_json::<ModelInfo>(&dir.join(PathsConfig::MODEL_METADATA_FILE_NAME))?;
        if let Some(model) = model.as_mut() {
            model.migrate_legacy_source();
        }
        Ok(model)
    }

    pub(super) fn list(root: &Path, downloaded_only: bool) -> Result<Vec<ModelInfo>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut models = Vec::new();
        for entry in fs::read_dir(root)
            .map_err(|e| PlexusError::io_with_path(e, root))?
            .filter_map(|e| e.ok())
        {
            let dir = entry.path();
            let Some(id) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !dir.is_dir() || model_dir(root, &id).is_err() {
                continue;
            }

            let model = match read(&dir) {
                Ok(Some(model)) => model,
                Ok(None) if has_binary(&dir, &id) => generate_metadata(&dir, &id)?,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping unreadable model {}: {}", dir.display(), e);
                    continue;
                }
            };
            if downloaded_only && model.runs_locally() && !has_binary(&dir, &model.id) {
                continue;
            }
            models.push(model);
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    pub(super) fn delete(root: &Path, id: &str) -> Result<usize> {
        let dir = model_dir(root, id)?;
        if !dir.is_dir() {
            return Err(PlexusError::ModelNotFound { id: id.to_string() });
        }

        let mut removed = 0;
        for entry in fs::read_dir(&dir)
            .map_err(|e| PlexusError::io_with_path(e, &dir))?
            .filter_map(|e| e.ok())
        {
            if entry.file_name() == PathsConfig::MODEL_METADATA_FILE_NAME {
                continue;
            }
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.map_err(|e| PlexusError::io_with_path(e, &path))?;
            removed += 1;
        }
        info!("Removed {} file(s) of model {}", removed, id);
        Ok(removed)
    }

    /// A file named after the model, or a finished `.gguf`.
    fn has_binary(dir: &Path, id: &str) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        entries.filter_map(|e| e.ok()).any(|entry| {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            entry.path().is_file()
                && (name == id.to_lowercase()
                    || (name.contains(BINARY_MARKER) && !name.ends_with(PARTIAL_SUFFIX)))
        })
    }

    /// Metadata for a folder someone filled by hand.
    fn generate_metadata(dir: &Path, id: &str) -> Result<ModelInfo> {
        let mut extra = serde_json::Map::new();
        extra.insert("description".into(), json!(format!("{} - user self import model", id)));
        extra.insert("created".into(), json!(chrono::Utc::now().timestamp_millis()));
        let model = ModelInfo {
            id: id.to_string(),
            name: Some(id.to_string()),
            engine: None,
            sources: Vec::new(),
            extra,
        };
        atomic_write_json(&dir.join(PathsConfig::MODEL_METADATA_FILE_NAME), &model, false)?;
        info!("Generated metadata for imported model {}", id);
        Ok(model)
    }
}

/// Model capability: metadata in [`ModelStore`], transfers through the
/// download manager.
pub struct ModelExtension {
    store: Arc<ModelStore>,
    downloads: DownloadManager,
}

impl ModelExtension {
    pub fn new(data_dir: &Path, downloads: DownloadManager) -> Self {
        Self {
            store: Arc::new(ModelStore::new(data_dir.join(PathsConfig::MODELS_DIR_NAME))),
            downloads,
        }
    }
}

/// Live download keys belonging to `id`.
fn live_keys(downloads: &DownloadManager, id: &str) -> Vec<String> {
    let prefix = format!("{}/", id);
    downloads
        .active()
        .into_iter()
        .map(|snapshot| snapshot.key)
        .filter(|key| key.starts_with(&prefix))
        .collect()
}

async fn download(store: &ModelStore, downloads: &DownloadManager, model: ModelInfo) -> Result<Value> {
    let dir = store.model_dir(&model.id)?;
    let files: Vec<(String, String, Option<String>)> = model
        .files()?
        .into_iter()
        .map(|(source, name)| (source.url.clone(), name, source.sha256.clone()))
        .collect();
    if files.is_empty() {
        return Err(PlexusError::InvalidParams {
            message: format!("model {} has no sources", model.id),
        });
    }

    let id = model.id.clone();
    store.save(model).await?;

    let mut keys = Vec::with_capacity(files.len());
    for (url, name, sha256) in files {
        let mut request = DownloadRequest::new(url, dir.join(&name)).with_key(format!("{}/{}", id, name));
        if let Some(sha256) = sha256 {
            request = request.with_sha256(sha256);
        }
        match downloads.start(request) {
            Ok(handle) => keys.push(handle.key().to_string()),
            Err(e) => {
                // All or nothing: stop what this call already started.
                for key in &keys {
                    let _ = downloads.abort(key);
                }
                return Err(e);
            }
        }
    }
    info!("Downloading model {} ({} file(s))", id, keys.len());
    Ok(json!({ "modelId": id, "keys": keys }))
}

#[async_trait]
impl Extension for ModelExtension {
    fn implements(&self, point: ActivationPoint) -> bool {
        point == ActivationPoint::OnLoad
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> Result<()> {
        let root = self.store.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| PlexusError::io_with_path(e, root))?;

        let (store, downloads) = (self.store.clone(), self.downloads.clone());
        ctx.register(
            ServiceName::ModelDownload,
            handler_fn(move |args| {
                let (store, downloads) = (store.clone(), downloads.clone());
                async move {
                    let ModelArgs { model } = parse_args(ServiceName::ModelDownload, args)?;
                    download(&store, &downloads, model).await
                }
            }),
        );

        let downloads = self.downloads.clone();
        ctx.register(
            ServiceName::ModelCancelDownload,
            handler_fn(move |args| {
                let downloads = downloads.clone();
                async move {
                    let ModelRef { model_id } = parse_args(ServiceName::ModelCancelDownload, args)?;
                    let keys = live_keys(&downloads, &model_id);
                    if keys.is_empty() {
                        return Err(PlexusError::DownloadNotFound { key: model_id });
                    }
                    for key in &keys {
                        downloads.abort(key)?;
                    }
                    Ok(json!({ "modelId": model_id, "aborting": keys }))
                }
            }),
        );

        let (store, downloads) = (self.store.clone(), self.downloads.clone());
        ctx.register(
            ServiceName::ModelDelete,
            handler_fn(move |args| {
                let (store, downloads) = (store.clone(), downloads.clone());
                async move {
                    let ModelRef { model_id } = parse_args(ServiceName::ModelDelete, args)?;
                    if !live_keys(&downloads, &model_id).is_empty() {
                        return Err(PlexusError::DownloadInProgress {
                            key: format!("{}/", model_id),
                        });
                    }
                    let removed = store.delete(&model_id).await?;
                    Ok(json!({ "modelId": model_id, "removed": removed }))
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::ModelSave,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let ModelArgs { model } = parse_args(ServiceName::ModelSave, args)?;
                    to_json(&store.save(model).await?)
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::ModelList,
            handler_fn(move |_| {
                let store = store.clone();
                async move { to_json(&store.list().await?) }
            }),
        );

        let (store, downloads) = (self.store.clone(), self.downloads.clone());
        ctx.register(
            ServiceName::ModelListDownloaded,
            handler_fn(move |_| {
                let (store, downloads) = (store.clone(), downloads.clone());
                async move {
                    // A binary still being written is not downloaded yet.
                    let models: Vec<ModelInfo> = store
                        .list_downloaded()
                        .await?
                        .into_iter()
                        .filter(|model| live_keys(&downloads, &model.id).is_empty())
                        .collect();
                    to_json(&models)
                }
            }),
        );

        debug!("Model storage at {}", root.display());
        Ok(())
    }
}
