//! Keyed download manager.
//!
//! Tracks at most one live transfer per key. Each transfer runs in its own
//! task, streams into the destination file, publishes throttled
//! `download.progress` events and finishes with exactly one terminal event
//! (`download.completed`, `download.aborted` or `download.error`). The task
//! leaves the active table before its terminal event goes out, so a
//! listener reacting to that event can immediately reuse the key.
//!
//! Partial files are never deleted. With `resume` set, an existing partial
//! file is continued with a `Range` request when the server supports it.

use crate::bridge::{BridgeEvent, EventBus};
use crate::cancel::CancelHandle;
use crate::config::NetworkConfig;
use crate::error::{PlexusError, Result};
use crate::network::client::HttpClient;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of a download request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Defaults to the destination's file name.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub resume: bool,
    /// Expected hex SHA-256 of the complete file.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            key: None,
            resume: false,
            sha256: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Key identifying this transfer.
    pub fn resolve_key(&self) -> Result<String> {
        if let Some(key) = self.key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| PlexusError::InvalidParams {
                message: format!(
                    "cannot derive a download key from {}",
                    self.destination.display()
                ),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Queued,
    InProgress,
    Completed,
    Aborted,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Aborted | DownloadState::Failed
        )
    }
}

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSnapshot {
    pub key: String,
    pub url: String,
    pub destination: PathBuf,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub state: DownloadState,
}

/// Final result of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub key: String,
    pub state: DownloadState,
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned by `start`; the transfer keeps running if the handle is dropped.
pub struct DownloadHandle {
    key: String,
    task: JoinHandle<DownloadOutcome>,
}

impl DownloadHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the transfer to reach a terminal state.
    pub async fn wait(self) -> Result<DownloadOutcome> {
        self.task
            .await
            .map_err(|e| PlexusError::Other(format!("download task for {} failed: {}", self.key, e)))
    }
}

/// Opened transfer body.
pub struct SourceResponse {
    /// Total size of the complete file, when known.
    pub total: Option<u64>,
    /// Whether the body continues from the requested offset. When false the
    /// body is the whole file and the destination is rewritten.
    pub resumed: bool,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Transport used by the download manager.
#[async_trait]
pub trait DownloadSource: Send + Sync + 'static {
    /// Open `url`, asking for data starting at `offset`.
    async fn open(&self, url: &str, offset: u64) -> Result<SourceResponse>;
}

/// reqwest-backed source.
pub struct HttpSource {
    http: HttpClient,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpClient::for_downloads()?,
        })
    }

    pub fn with_client(http: HttpClient) -> Self {
        Self { http }
    }
}

/// How to treat a response to a request starting at `offset`.
///
/// Returns `(resumed, total)`.
fn classify_response(
    status: StatusCode,
    offset: u64,
    content_length: Option<u64>,
) -> std::result::Result<(bool, Option<u64>), String> {
    match status {
        StatusCode::PARTIAL_CONTENT if offset > 0 => {
            Ok((true, content_length.map(|len| offset + len)))
        }
        // Partial file already holds everything.
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => Ok((true, Some(offset))),
        s if s.is_success() => Ok((false, content_length)),
        s => Err(format!("server returned {}", s)),
    }
}

#[async_trait]
impl DownloadSource for HttpSource {
    async fn open(&self, url: &str, offset: u64) -> Result<SourceResponse> {
        let response = self.http.get_from(url, offset).await?;
        let status = response.status();
        let (resumed, total) = classify_response(status, offset, response.content_length())
            .map_err(|message| PlexusError::DownloadFailed {
                url: url.to_string(),
                message,
            })?;

        if offset > 0 && !resumed {
            debug!("{} ignored Range request; restarting from zero", url);
        }

        let body = if status == StatusCode::RANGE_NOT_SATISFIABLE {
            futures::stream::empty().boxed()
        } else {
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(PlexusError::from))
                .boxed()
        };

        Ok(SourceResponse {
            total,
            resumed,
            body,
        })
    }
}

struct TaskEntry {
    snapshot: DownloadSnapshot,
    cancel: CancelHandle,
}

/// Download manager. Cheap to clone; clones share the active table.
#[derive(Clone)]
pub struct DownloadManager {
    source: Arc<dyn DownloadSource>,
    events: EventBus,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
    progress_interval: Duration,
}

impl DownloadManager {
    pub fn new(source: Arc<dyn DownloadSource>, events: EventBus) -> Self {
        Self {
            source,
            events,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    /// Manager using the HTTP transport.
    pub fn with_http(events: EventBus) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpSource::new()?), events))
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Start a transfer in the background.
    ///
    /// Fails with `DownloadInProgress` while a transfer with the same key or
    /// the same destination is live.
    pub fn start(&self, request: DownloadRequest) -> Result<DownloadHandle> {
        url::Url::parse(&request.url).map_err(|e| PlexusError::InvalidParams {
            message: format!("invalid download url '{}': {}", request.url, e),
        })?;
        let key = request.resolve_key()?;
        let cancel = CancelHandle::new();

        {
            let mut tasks = self.lock();
            if tasks.contains_key(&key) {
                return Err(PlexusError::DownloadInProgress { key });
            }
            if let Some(entry) = tasks
                .values()
                .find(|entry| entry.snapshot.destination == request.destination)
            {
                return Err(PlexusError::DownloadInProgress {
                    key: entry.snapshot.key.clone(),
                });
            }
            tasks.insert(
                key.clone(),
                TaskEntry {
                    snapshot: DownloadSnapshot {
                        key: key.clone(),
                        url: request.url.clone(),
                        destination: request.destination.clone(),
                        bytes_transferred: 0,
                        bytes_total: None,
                        state: DownloadState::Queued,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        info!("Starting download {} from {}", key, request.url);
        let manager = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move { manager.run(task_key, request, cancel).await });

        Ok(DownloadHandle { key, task })
    }

    /// Signal the live transfer for `key` to stop.
    pub fn abort(&self, key: &str) -> Result<()> {
        let tasks = self.lock();
        let entry = tasks.get(key).ok_or_else(|| PlexusError::DownloadNotFound {
            key: key.to_string(),
        })?;
        if entry.cancel.cancel() {
            info!("Abort requested for download {}", key);
        }
        Ok(())
    }

    /// Snapshot of a live transfer.
    pub fn state(&self, key: &str) -> Option<DownloadSnapshot> {
        self.lock().get(key).map(|entry| entry.snapshot.clone())
    }

    /// Snapshots of all live transfers, ordered by key.
    pub fn active(&self) -> Vec<DownloadSnapshot> {
        let mut snapshots: Vec<_> = self
            .lock()
            .values()
            .map(|entry| entry.snapshot.clone())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Abort every live transfer.
    pub fn abort_all(&self) {
        for entry in self.lock().values() {
            entry.cancel.cancel();
        }
    }

    async fn run(self, key: String, request: DownloadRequest, cancel: CancelHandle) -> DownloadOutcome {
        self.update(&key, |s| s.state = DownloadState::InProgress);

        let result = self.transfer(&key, &request, &cancel).await;
        let bytes_transferred = self
            .state(&key)
            .map(|s| s.bytes_transferred)
            .unwrap_or_default();

        // Free the key before anyone hears about the terminal state.
        self.lock().remove(&key);

        let (state, bytes_transferred, error, event) = match result {
            Ok(bytes) => {
                info!("Download {} completed ({} bytes)", key, bytes);
                (
                    DownloadState::Completed,
                    bytes,
                    None,
                    BridgeEvent::DownloadCompleted {
                        key: key.clone(),
                        destination: request.destination.display().to_string(),
                        bytes_transferred: bytes,
                    },
                )
            }
            Err(PlexusError::DownloadCancelled) => {
                info!("Download {} aborted after {} bytes", key, bytes_transferred);
                (
                    DownloadState::Aborted,
                    bytes_transferred,
                    None,
                    BridgeEvent::DownloadAborted {
                        key: key.clone(),
                        bytes_transferred,
                    },
                )
            }
            Err(e) => {
                warn!("Download {} failed: {}", key, e);
                (
                    DownloadState::Failed,
                    bytes_transferred,
                    Some(e.to_string()),
                    BridgeEvent::DownloadError {
                        key: key.clone(),
                        code: e.error_code().to_string(),
                        message: e.to_string(),
                    },
                )
            }
        };
        self.events.publish(event);

        DownloadOutcome {
            key,
            state,
            bytes_transferred,
            error,
        }
    }

    async fn transfer(&self, key: &str, request: &DownloadRequest, cancel: &CancelHandle) -> Result<u64> {
        let destination = &request.destination;
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlexusError::io_with_path(e, parent))?;
        }

        let offset = if request.resume {
            match tokio::fs::metadata(destination).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => 0,
            }
        } else {
            0
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PlexusError::DownloadCancelled),
            response = self.source.open(&request.url, offset) => response?,
        };

        let mut file = if response.resumed {
            debug!("Resuming {} at byte {}", key, offset);
            tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(destination)
                .await
        } else {
            tokio::fs::File::create(destination).await
        }
        .map_err(|e| PlexusError::io_with_path(e, destination))?;

        let mut transferred = if response.resumed { offset } else { 0 };
        let total = response.total;
        self.update(key, |s| {
            s.bytes_total = total;
            s.bytes_transferred = transferred;
        });

        let mut body = response.body;
        let mut last_emit: Option<Instant> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(PlexusError::DownloadCancelled);
                }
                chunk = body.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|e| PlexusError::io_with_path(e, destination))?;
            transferred += chunk.len() as u64;
            self.update(key, |s| s.bytes_transferred = transferred);

            if last_emit.map_or(true, |at| at.elapsed() >= self.progress_interval) {
                self.publish_progress(key, transferred, total);
                last_emit = Some(Instant::now());
            }
        }

        file.flush()
            .await
            .map_err(|e| PlexusError::io_with_path(e, destination))?;
        file.sync_all()
            .await
            .map_err(|e| PlexusError::io_with_path(e, destination))?;
        drop(file);

        cancel.check()?;
        self.publish_progress(key, transferred, total);

        if let Some(expected) = request.sha256.as_deref() {
            verify_sha256(destination, expected).await?;
        }

        Ok(transferred)
    }

    fn publish_progress(&self, key: &str, bytes_transferred: u64, bytes_total: Option<u64>) {
        self.events.publish(BridgeEvent::DownloadProgress {
            key: key.to_string(),
            bytes_transferred,
            bytes_total,
        });
    }

    fn update(&self, key: &str, apply: impl FnOnce(&mut DownloadSnapshot)) {
        if let Some(entry) = self.lock().get_mut(key) {
            apply(&mut entry.snapshot);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let path_buf = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file =
            std::fs::File::open(&path_buf).map_err(|e| PlexusError::io_with_path(e, &path_buf))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|e| PlexusError::io_with_path(e, &path_buf))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| PlexusError::Other(format!("hash task failed: {}", e)))??;

    if actual.eq_ignore_ascii_case(expected) {
        debug!("SHA-256 verified for {}", path.display());
        Ok(())
    } else {
        Err(PlexusError::HashMismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}
