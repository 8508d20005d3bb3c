//! System monitoring capability.

use super::to_json;
use crate::dispatch::{handler_fn, ServiceName};
use crate::error::Result;
use crate::extension::{ActivationPoint, Extension, ExtensionContext};
use crate::system::SystemMonitor;
use async_trait::async_trait;

pub struct MonitoringExtension {
    monitor: SystemMonitor,
}

impl MonitoringExtension {
    pub fn new(monitor: SystemMonitor) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl Extension for MonitoringExtension {
    fn implements(&self, point: ActivationPoint) -> bool {
        point == ActivationPoint::OnLoad
    }

    async fn on_load(&self, ctx: &ExtensionContext) -> Result<()> {
        let monitor = self.monitor.clone();
        ctx.register(
            ServiceName::MonitoringResourcesInfo,
            handler_fn(move |_| {
                let monitor = monitor.clone();
                async move { to_json(&monitor.resources().await?) }
            }),
        );

        let monitor = self.monitor.clone();
        ctx.register(
            ServiceName::MonitoringCurrentLoad,
            handler_fn(move |_| {
                let monitor = monitor.clone();
                async move { to_json(&monitor.current_load().await?) }
            }),
        );
        Ok(())
    }
}
