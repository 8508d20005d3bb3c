//! Local model-serving backend.
//!
//! Supervises one backend process that speaks HTTP on a loopback port:
//! spawn, wait for the port, health check, model load/unload, completions
//! and shutdown. Calls into the backend go through the `backend` queue
//! class so they never overlap.

use crate::config::{BackendTimings, QueueConfig};
use crate::error::{PlexusError, Result};
use crate::network::client::{ensure_success, HttpClient};
use crate::queue::{BoundedQueue, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How to launch and talk to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_load_path")]
    pub load_path: String,
    #[serde(default = "default_unload_path")]
    pub unload_path: String,
    #[serde(default = "default_completion_path")]
    pub completion_path: String,
    #[serde(default = "default_kill_path")]
    pub kill_path: String,
    #[serde(default = "default_startup_timeout", with = "millis")]
    pub startup_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "millis")]
    pub shutdown_timeout: Duration,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    BackendTimings::DEFAULT_PORT
}
fn default_health_path() -> String {
    "/healthz".into()
}
fn default_load_path() -> String {
    "/inferences/server/loadmodel".into()
}
fn default_unload_path() -> String {
    "/inferences/server/unloadmodel".into()
}
fn default_completion_path() -> String {
    "/v1/chat/completions".into()
}
fn default_kill_path() -> String {
    "/processmanager/destroy".into()
}
fn default_startup_timeout() -> Duration {
    BackendTimings::STARTUP_TIMEOUT
}
fn default_shutdown_timeout() -> Duration {
    BackendTimings::SHUTDOWN_TIMEOUT
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl BackendConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            host: default_host(),
            port: default_port(),
            health_path: default_health_path(),
            load_path: default_load_path(),
            unload_path: default_unload_path(),
            completion_path: default_completion_path(),
            kill_path: default_kill_path(),
            startup_timeout: default_startup_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub model: Option<String>,
}

#[derive(Default)]
struct BackendState {
    child: Option<Child>,
    model: Option<String>,
}

/// Cheap to clone; clones control the same process.
#[derive(Clone)]
pub struct BackendController {
    config: Arc<BackendConfig>,
    http: HttpClient,
    queue: BoundedQueue,
    state: Arc<Mutex<BackendState>>,
}

impl BackendController {
    pub fn new(config: BackendConfig, queue: BoundedQueue) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
            http: HttpClient::new()?,
            queue,
            state: Arc::new(Mutex::new(BackendState::default())),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Start the backend, replacing any instance this controller started
    /// earlier. Returns once the health check passes.
    pub async fn start(&self) -> Result<BackendStatus> {
        self.stop().await?;

        let mut state = self.state.lock().await;
        info!(
            "Starting backend {} on port {}",
            self.config.executable.display(),
            self.config.port
        );
        let mut child = Command::new(&self.config.executable)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlexusError::LaunchFailed {
                message: format!("{}: {}", self.config.executable.display(), e),
            })?;

        if let Err(e) = self.wait_until_listening(&mut child).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let url = self.config.url(&self.config.health_path);
        let http = self.http.clone();
        let healthy = self
            .queue
            .enqueue(
                QueueConfig::BACKEND_CLASS,
                RetryPolicy::fixed(BackendTimings::HEALTH_ATTEMPTS, BackendTimings::RETRY_DELAY),
                move || {
                    let http = http.clone();
                    let url = url.clone();
                    async move {
                        let response = http.get(&url).await?;
                        ensure_success(response, &url).map(|_| ())
                    }
                },
            )
            .await;

        if let Err(e) = healthy {
            warn!("Backend failed its health check: {}", e);
            let _ = child.kill().await;
            return Err(e);
        }

        let pid = child.id();
        state.child = Some(child);
        state.model = None;
        info!("Backend is healthy (pid {:?})", pid);

        Ok(BackendStatus {
            running: true,
            pid,
            port: self.config.port,
            model: None,
        })
    }

    /// Ask the backend to load a model. `settings` is passed through as the
    /// request body; its `model` (or `llama_model_path`) names the model.
    pub async fn load_model(&self, settings: Value) -> Result<Value> {
        self.ensure_running().await?;
        let result = self
            .post(
                &self.config.load_path,
                settings.clone(),
                RetryPolicy::fixed(BackendTimings::LOAD_ATTEMPTS, BackendTimings::RETRY_DELAY),
            )
            .await?;

        let model = settings
            .get("model")
            .or_else(|| settings.get("llama_model_path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        info!("Backend loaded model {:?}", model);
        self.state.lock().await.model = model;
        Ok(result)
    }

    pub async fn unload_model(&self) -> Result<Value> {
        self.ensure_running().await?;
        let result = self
            .post(&self.config.unload_path, Value::Null, RetryPolicy::none())
            .await?;
        self.state.lock().await.model = None;
        Ok(result)
    }

    pub async fn complete(&self, request: Value) -> Result<Value> {
        self.ensure_running().await?;
        self.post(&self.config.completion_path, request, RetryPolicy::none())
            .await
    }

    /// Stop the process started by this controller, if any: kill request,
    /// then kill the child, then wait for the port to be released.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut child) = state.child.take() else {
            return Ok(());
        };
        state.model = None;

        let kill_url = self.config.url(&self.config.kill_path);
        match tokio::time::timeout(BackendTimings::KILL_REQUEST_TIMEOUT, self.http.delete(&kill_url)).await {
            Ok(Ok(response)) => debug!("Kill request answered {}", response.status()),
            Ok(Err(e)) => debug!("Kill request failed: {}", e),
            Err(_) => debug!("Kill request timed out"),
        }

        terminate(&mut child).await;

        if !self.wait_for_port(false, self.config.shutdown_timeout).await {
            warn!(
                "Port {} still in use {:?} after stopping the backend",
                self.config.port, self.config.shutdown_timeout
            );
        }
        info!("Backend stopped");
        Ok(())
    }

    pub async fn status(&self) -> BackendStatus {
        let mut state = self.state.lock().await;
        let exited = match state.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if exited {
            warn!("Backend process exited on its own");
            state.child = None;
            state.model = None;
        }

        BackendStatus {
            running: state.child.is_some(),
            pid: state.child.as_ref().and_then(|c| c.id()),
            port: self.config.port,
            model: state.model.clone(),
        }
    }

    async fn ensure_running(&self) -> Result<()> {
        if self.status().await.running {
            Ok(())
        } else {
            Err(PlexusError::BackendNotRunning)
        }
    }

    async fn post(&self, path: &str, body: Value, policy: RetryPolicy) -> Result<Value> {
        let url = self.config.url(path);
        let http = self.http.clone();
        self.queue
            .enqueue(QueueConfig::BACKEND_CLASS, policy, move || {
                let http = http.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let response = ensure_success(http.post_json(&url, &body).await?, &url)?;
                    let text = response.text().await.map_err(|e| PlexusError::Network {
                        message: format!("reading {} failed: {}", url, e),
                        source: Some(e),
                    })?;
                    if text.trim().is_empty() {
                        return Ok(Value::Null);
                    }
                    serde_json::from_str(&text).map_err(|e| PlexusError::Json {
                        message: format!("invalid response from {}: {}", url, e),
                        source: Some(e),
                    })
                }
            })
            .await
    }

    async fn wait_until_listening(&self, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if TcpStream::connect(self.config.addr()).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(PlexusError::LaunchFailed {
                    message: format!("backend exited during startup: {}", status),
                });
            }
            if Instant::now() >= deadline {
                return Err(PlexusError::Timeout(self.config.startup_timeout));
            }
            tokio::time::sleep(BackendTimings::PORT_POLL_INTERVAL).await;
        }
    }

    /// Poll until the port is (or is no longer) accepting connections.
    async fn wait_for_port(&self, in_use: bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let listening = TcpStream::connect(self.config.addr()).await.is_ok();
            if listening == in_use {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(BackendTimings::PORT_POLL_INTERVAL).await;
        }
    }
}

/// SIGTERM with a grace period, then a hard kill.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
                && tokio::time::timeout(BackendTimings::TERM_GRACE, child.wait())
                    .await
                    .is_ok()
            {
                return;
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Backend already exited: {}", e);
    }
}
