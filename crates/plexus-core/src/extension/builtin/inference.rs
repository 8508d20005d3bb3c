//! Local inference capability on top of [`BackendController`].
//!
//! The backend process is started lazily by the first `Inference.LoadModel`
//! and stopped by `Inference.UnloadModel` or when the extension unloads.

use super::to_json;
use crate::backend::BackendController;
use crate::dispatch::{handler_fn, ServiceName};
use crate::error::Result;
use crate::extension::{ActivationPoint, Extension, ExtensionContext};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

pub struct InferenceExtension {
    backend: BackendController,
}

impl InferenceExtension {
    pub fn new(backend: BackendController) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Extension for InferenceExtension {
    fn implements(&self, _point: ActivationPoint) -> bool {
        true
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> Result<()> {
        let backend = self.backend.clone();
        ctx.register(
            ServiceName::InferenceLoadModel,
            handler_fn(move |settings| {
                let backend = backend.clone();
                async move {
                    if !backend.status().await.running {
                        backend.start().await?;
                    }
                    backend.load_model(settings).await
                }
            }),
        );

        let backend = self.backend.clone();
        ctx.register(
            ServiceName::InferenceUnloadModel,
            handler_fn(move |_| {
                let backend = backend.clone();
                async move {
                    if backend.status().await.running {
                        if let Err(e) = backend.unload_model().await {
                            debug!("Unload request failed, stopping anyway: {}", e);
                        }
                        backend.stop().await?;
                    }
                    Ok(json!({ "unloaded": true }))
                }
            }),
        );

        let backend = self.backend.clone();
        ctx.register(
            ServiceName::InferenceStatus,
            handler_fn(move |_| {
                let backend = backend.clone();
                async move { to_json(&backend.status().await) }
            }),
        );

        let backend = self.backend.clone();
        ctx.register(
            ServiceName::InferenceComplete,
            handler_fn(move |request| {
                let backend = backend.clone();
                async move { backend.complete(request).await }
            }),
        );
        Ok(())
    }

    async fn on_unload(&self, _ctx: &ExtensionContext) -> Result<()> {
        info!("Stopping inference backend");
        self.backend.stop().await
    }
}
