//! Bridge method handlers.

use super::PlexusRuntime;
use crate::bridge::{BridgeDispatch, BridgeMethod, EventBus};
use crate::dispatch::ServiceName;
use crate::error::{PlexusError, Result};
use crate::extension::CapabilityType;
use crate::network::DownloadRequest;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct OptionalKeyParams {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstallParams {
    #[serde(default)]
    paths: Vec<PathBuf>,
    #[serde(default)]
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetActiveParams {
    capability_type: CapabilityType,
    name: String,
    /// Re-run `load()` so the choice takes effect immediately.
    #[serde(default)]
    reload: bool,
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    /// Kept as text so an unknown name reads as unavailable, not malformed.
    service: String,
    #[serde(default)]
    args: Value,
}

fn params<T: DeserializeOwned>(method: BridgeMethod, params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| PlexusError::InvalidParams {
        message: format!("{}: {}", method, e),
    })
}

impl PlexusRuntime {
    async fn start_download(&self, mut request: DownloadRequest) -> Result<Value> {
        if request.destination.is_relative() {
            request.destination = self.data_dir.join(&request.destination);
        }
        let handle = self.downloads.start(request)?;
        Ok(json!({ "key": handle.key() }))
    }

    async fn named_service(&self, params: ExecuteParams, serial: bool) -> Result<Value> {
        match params.service.parse::<ServiceName>() {
            Ok(service) => self.service(service, params.args, serial).await,
            Err(_) => {
                debug!("No such service {}", params.service);
                Ok(json!({ "status": "unavailable", "service": params.service }))
            }
        }
    }

    async fn service(&self, service: ServiceName, args: Value, serial: bool) -> Result<Value> {
        let outcome = if serial {
            self.execute_serial(service, args).await?
        } else {
            self.execute(service, args).await?
        };
        Ok(outcome.to_json())
    }
}

#[async_trait]
impl BridgeDispatch for PlexusRuntime {
    async fn dispatch(&self, method: BridgeMethod, p: Value) -> Result<Value> {
        debug!("Bridge call {}", method);
        match method {
            BridgeMethod::StartDownload => {
                let request: DownloadRequest = params(method, p)?;
                self.start_download(request).await
            }
            BridgeMethod::AbortDownload => {
                let KeyParams { key } = params(method, p)?;
                self.downloads.abort(&key)?;
                Ok(json!({ "key": key, "aborting": true }))
            }
            BridgeMethod::GetDownloadState => {
                let OptionalKeyParams { key } = params(method, p)?;
                match key {
                    Some(key) => Ok(serde_json::to_value(self.downloads.state(&key))?),
                    None => Ok(serde_json::to_value(self.downloads.active())?),
                }
            }

            BridgeMethod::GetActiveExtensions => Ok(serde_json::to_value(self.registry.active().await)?),
            BridgeMethod::ListExtensions => Ok(serde_json::to_value(self.registry.list().await)?),
            BridgeMethod::InstallExtension => {
                let InstallParams { mut paths, path } = params(method, p)?;
                paths.extend(path);
                if paths.is_empty() {
                    return Err(PlexusError::InvalidParams {
                        message: format!("{}: no package paths given", method),
                    });
                }
                Ok(serde_json::to_value(self.install(&paths).await)?)
            }
            BridgeMethod::UninstallExtension => {
                let NameParams { name } = params(method, p)?;
                self.registry.uninstall(&name).await?;
                Ok(json!({ "name": name, "uninstalled": true }))
            }
            BridgeMethod::SetActiveExtension => {
                let SetActiveParams {
                    capability_type,
                    name,
                    reload,
                } = params(method, p)?;
                let settings = self.registry.set_active(capability_type, &name).await?;
                if reload {
                    self.load().await?;
                }
                Ok(serde_json::to_value(settings)?)
            }
            BridgeMethod::GetSettings => Ok(serde_json::to_value(self.settings.snapshot().await)?),

            BridgeMethod::ExecuteService => self.named_service(params(method, p)?, false).await,
            BridgeMethod::ExecuteServiceSerial => self.named_service(params(method, p)?, true).await,

            BridgeMethod::GetSystemResources => self.service(ServiceName::MonitoringResourcesInfo, p, false).await,
            BridgeMethod::GetCurrentLoad => self.service(ServiceName::MonitoringCurrentLoad, p, false).await,

            BridgeMethod::StartModel => self.service(ServiceName::InferenceLoadModel, p, false).await,
            BridgeMethod::StopModel => self.service(ServiceName::InferenceUnloadModel, p, false).await,
            BridgeMethod::ModelStatus => self.service(ServiceName::InferenceStatus, p, false).await,

            BridgeMethod::Ping => Ok(json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") })),
        }
    }

    fn events(&self) -> EventBus {
        self.events.clone()
    }
}
