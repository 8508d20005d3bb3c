//! JSON-file conversation storage.
//!
//! Layout under `<data_dir>/threads/`:
//! `<thread id>/thread.json` holds the thread, `<thread id>/messages.jsonl`
//! one message per line in insertion order.

use super::{parse_args, run_blocking, to_json};
use crate::atomic::{atomic_read_json, atomic_write_json};
use crate::config::PathsConfig;
use crate::dispatch::{handler_fn, ServiceName};
use crate::error::{PlexusError, Result};
use crate::extension::{ActivationPoint, Extension, ExtensionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const THREAD_FILE: &str = "thread.json";
const MESSAGES_FILE: &str = "messages.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub object: String,
    pub title: String,
    #[serde(default)]
    pub assistants: Vec<Value>,
    /// Milliseconds since the epoch.
    pub created: i64,
    pub updated: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub id: String,
    pub thread_id: String,
    pub role: MessageRole,
    pub content: Value,
    pub created: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewThread {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub assistants: Vec<Value>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub thread_id: String,
    pub role: MessageRole,
    pub content: Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadRef {
    #[serde(alias = "threadId")]
    id: String,
}

/// Thread storage. Disk work runs on the blocking pool; writes to one
/// thread are serialized.
pub struct ThreadStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create(&self, request: NewThread) -> Result<Thread> {
        let root = self.root.clone();
        run_blocking(move || disk::create(&root, request)).await
    }

    /// All readable threads, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Thread>> {
        let root = self.root.clone();
        run_blocking(move || disk::list(&root)).await
    }

    pub async fn get(&self, id: &str) -> Result<Thread> {
        let (root, id) = (self.root.clone(), id.to_string());
        run_blocking(move || disk::read(&root, &id)).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let (root, owned) = (self.root.clone(), id.to_string());
        run_blocking(move || disk::delete(&root, &owned)).await?;
        self.locks_guard().remove(id);
        Ok(())
    }

    pub async fn add_message(&self, request: NewMessage) -> Result<ThreadMessage> {
        let lock = self.lock_for(&request.thread_id);
        let _guard = lock.lock().await;
        let root = self.root.clone();
        run_blocking(move || disk::append(&root, request)).await
    }

    pub async fn messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let (root, id) = (self.root.clone(), thread_id.to_string());
        run_blocking(move || disk::messages(&root, &id)).await
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks_guard().entry(id.to_string()).or_default().clone()
    }

    fn locks_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Blocking file operations behind [`ThreadStore`].
mod disk {
    use super::*;

    pub(super) fn create(root: &Path, request: NewThread) -> Result<Thread> {
        let now = chrono::Utc::now().timestamp_millis();
        let thread = Thread {
            id: uuid::Uuid::new_v4().to_string(),
            object: "thread".into(),
            title: request.title.unwrap_or_else(|| "New Thread".into()),
            assistants: request.assistants,
            created: now,
            updated: now,
            metadata: request.metadata,
        };

        let dir = root.join(&thread.id);
        fs::create_dir_all(&dir).map_err(|e| PlexusError::io_with_path(e, &dir))?;
        atomic_write_json(&dir.join(THREAD_FILE), &thread, false)?;
        debug!("Created thread {}", thread.id);
        Ok(thread)
    }

    pub(super) fn list(root: &Path) -> Result<Vec<Thread>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut threads = Vec::new();
        for entry in fs::read_dir(root)
            .map_err(|e| PlexusError::io_with_path(e, root))?
            .filter_map(|e| e.ok())
        {
            let path = entry.path().join(THREAD_FILE);
            match atomic_read_json::<Thread>(&path) {
                Ok(Some(thread)) => threads.push(thread),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable thread {}: {}", path.display(), e),
            }
        }
        threads.sort_by(|a, b| b.updated.cmp(&a.updated).then_with(|| a.id.cmp(&b.id)));
        Ok(threads)
    }

    pub(super) fn read(root: &Path, id: &str) -> Result<Thread> {
        let dir = thread_dir(root, id)?;
        atomic_read_json(&dir.join(THREAD_FILE))?.ok_or_else(|| PlexusError::ThreadNotFound { id: id.to_string() })
    }

    pub(super) fn delete(root: &Path, id: &str) -> Result<()> {
        let dir = thread_dir(root, id)?;
        if !dir.is_dir() {
            return Err(PlexusError::ThreadNotFound { id: id.to_string() });
        }
        fs::remove_dir_all(&dir).map_err(|e| PlexusError::io_with_path(e, &dir))?;
        debug!("Deleted thread {}", id);
        Ok(())
    }

    pub(super) fn append(root: &Path, request: NewMessage) -> Result<ThreadMessage> {
        let mut thread = read(root, &request.thread_id)?;
        let message = ThreadMessage {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread.id.clone(),
            role: request.role,
            content: request.content,
            created: chrono::Utc::now().timestamp_millis(),
            metadata: request.metadata,
        };

        let dir = thread_dir(root, &thread.id)?;
        let path = dir.join(MESSAGES_FILE);
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PlexusError::io_with_path(e, &path))?;
        file.write_all(line.as_bytes())
            .map_err(|e| PlexusError::io_with_path(e, &path))?;

        thread.updated = message.created.max(thread.updated);
        atomic_write_json(&dir.join(THREAD_FILE), &thread, false)?;
        Ok(message)
    }

    pub(super) fn messages(root: &Path, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        read(root, thread_id)?;
        let path = thread_dir(root, thread_id)?.join(MESSAGES_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PlexusError::io_with_path(e, &path)),
        };

        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping malformed message in {}: {}", path.display(), e);
                    None
                }
            })
            .collect())
    }

    fn thread_dir(root: &Path, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PlexusError::InvalidParams {
                message: format!("invalid thread id '{}'", id),
            });
        }
        Ok(root.join(id))
    }
}

/// Conversational capability backed by [`ThreadStore`].
pub struct ConversationalExtension {
    store: Arc<ThreadStore>,
}

impl ConversationalExtension {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            store: Arc::new(ThreadStore::new(data_dir.join(PathsConfig::THREADS_DIR_NAME))),
        }
    }
}

#[async_trait]
impl Extension for ConversationalExtension {
    fn implements(&self, point: ActivationPoint) -> bool {
        point == ActivationPoint::OnLoad
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> Result<()> {
        let root = self.store.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| PlexusError::io_with_path(e, root))?;

        let store = self.store.clone();
        ctx.register(
            ServiceName::CreateConversation,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let request: NewThread = parse_args(ServiceName::CreateConversation, args)?;
                    to_json(&store.create(request).await?)
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::ListConversations,
            handler_fn(move |_| {
                let store = store.clone();
                async move { to_json(&store.list().await?) }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::GetConversation,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let thread: ThreadRef = parse_args(ServiceName::GetConversation, args)?;
                    to_json(&store.get(&thread.id).await?)
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::DeleteConversation,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let thread: ThreadRef = parse_args(ServiceName::DeleteConversation, args)?;
                    store.delete(&thread.id).await?;
                    Ok(json!({ "id": thread.id, "deleted": true }))
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::AddMessage,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let request: NewMessage = parse_args(ServiceName::AddMessage, args)?;
                    to_json(&store.add_message(request).await?)
                }
            }),
        );

        let store = self.store.clone();
        ctx.register(
            ServiceName::GetMessages,
            handler_fn(move |args| {
                let store = store.clone();
                async move {
                    let thread: ThreadRef = parse_args(ServiceName::GetMessages, args)?;
                    to_json(&store.messages(&thread.id).await?)
                }
            }),
        );

        debug!("Conversation storage at {}", root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(thread_id: &str, text: &str) -> NewMessage {
        NewMessage {
            thread_id: thread_id.into(),
            role: MessageRole::User,
            content: json!(text),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_thread_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::new(dir.path());

        let thread = store
            .create(NewThread {
                title: Some("Trip planning".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(dir.path().join(&thread.id).join("thread.json").is_file());
        assert_eq!(store.get(&thread.id).await.unwrap(), thread);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&thread.id).await.unwrap();
        assert!(matches!(
            store.get(&thread.id).await,
            Err(PlexusError::ThreadNotFound { .. })
        ));
        assert!(store.delete(&thread.id).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_append_in_order() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::new(dir.path());
        let thread = store.create(NewThread::default()).await.unwrap();

        assert!(store.messages(&thread.id).await.unwrap().is_empty());
        store.add_message(message(&thread.id, "hello")).await.unwrap();
        store.add_message(message(&thread.id, "again")).await.unwrap();

        let messages = store.messages(&thread.id).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec![json!("hello"), json!("again")]);
        assert!(store.get(&thread.id).await.unwrap().updated >= thread.updated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_keep_every_message_and_latest_update() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ThreadStore::new(dir.path()));
        let thread = store.create(NewThread::default()).await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                let id = thread.id.clone();
                tokio::spawn(async move { store.add_message(message(&id, &format!("m{}", i))).await })
            })
            .collect();
        let mut latest = 0;
        for writer in writers {
            latest = latest.max(writer.await.unwrap().unwrap().created);
        }

        assert_eq!(store.messages(&thread.id).await.unwrap().len(), 16);
        assert_eq!(store.get(&thread.id).await.unwrap().updated, latest.max(thread.updated));
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::new(dir.path());
        let thread = store.create(NewThread::default()).await.unwrap();
        store.add_message(message(&thread.id, "ok")).await.unwrap();

        let path = dir.path().join(&thread.id).join(MESSAGES_FILE);
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n");
        fs::write(&path, raw).unwrap();

        assert_eq!(store.messages(&thread.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::new(dir.path());
        assert!(matches!(
            store.get("../etc").await,
            Err(PlexusError::InvalidParams { .. })
        ));
        assert!(store.add_message(message("missing", "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted_by_update() {
        let dir = TempDir::new().unwrap();
        let store = ThreadStore::new(dir.path());
        let older = store.create(NewThread::default()).await.unwrap();
        let newer = store.create(NewThread::default()).await.unwrap();

        let mut bumped = store.get(&older.id).await.unwrap();
        bumped.updated = newer.updated + 1_000;
        atomic_write_json(&dir.path().join(&older.id).join(THREAD_FILE), &bumped, false).unwrap();

        let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }
}
