//! `Download.Start` / `Download.Abort` on top of the download manager.
//!
//! Relative destinations resolve against the data directory.

use super::{parse_args, to_json};
use crate::dispatch::{handler_fn, ServiceName};
use crate::error::Result;
use crate::extension::{ActivationPoint, Extension, ExtensionContext};
use crate::network::{DownloadManager, DownloadRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct AbortArgs {
    key: String,
}

pub struct DownloadExtension {
    downloads: DownloadManager,
}

impl DownloadExtension {
    pub fn new(downloads: DownloadManager) -> Self {
        Self { downloads }
    }
}

#[async_trait]
impl Extension for DownloadExtension {
    fn implements(&self, point: ActivationPoint) -> bool {
        point == ActivationPoint::OnLoad
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> Result<()> {
        let downloads = self.downloads.clone();
        let data_dir = ctx.data_dir().to_path_buf();
        ctx.register(
            ServiceName::DownloadStart,
            handler_fn(move |args| {
                let downloads = downloads.clone();
                let data_dir = data_dir.clone();
                async move {
                    let mut request: DownloadRequest = parse_args(ServiceName::DownloadStart, args)?;
                    if request.destination.is_relative() {
                        request.destination = data_dir.join(&request.destination);
                    }
                    let handle = downloads.start(request)?;
                    let key = handle.key().to_string();
                    // `download` is null when the transfer already finished.
                    Ok(json!({ "key": key, "download": to_json(&downloads.state(&key))? }))
                }
            }),
        );

        let downloads = self.downloads.clone();
        ctx.register(
            ServiceName::DownloadAbort,
            handler_fn(move |args| {
                let downloads = downloads.clone();
                async move {
                    let AbortArgs { key } = parse_args(ServiceName::DownloadAbort, args)?;
                    downloads.abort(&key)?;
                    Ok(json!({ "key": key, "aborting": true }))
                }
            }),
        );
        Ok(())
    }
}
