//! Persisted runtime settings.
//!
//! `settings.json` records which extension the user selected per capability
//! type and which extensions they disabled. Every change is written
//! atomically and announced on the event bus as `settings.changed`.

use crate::atomic::{atomic_read_json, atomic_write_json};
use crate::bridge::{BridgeEvent, EventBus};
use crate::error::Result;
use crate::extension::CapabilityType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Explicit selection per capability type. Wins over registration order.
    #[serde(default)]
    pub active_extensions: BTreeMap<CapabilityType, String>,
    #[serde(default)]
    pub disabled_extensions: BTreeSet<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<RuntimeSettings>,
    events: EventBus,
}

impl SettingsStore {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. An unreadable one is logged and
    /// replaced by defaults on the next write; its previous contents survive
    /// in the `.bak` copy.
    pub fn load(path: impl Into<PathBuf>, events: EventBus) -> Self {
        let path = path.into();
        let current = match atomic_read_json::<RuntimeSettings>(&path) {
            Ok(Some(settings)) => settings,
            Ok(None) => RuntimeSettings::default(),
            Err(e) => {
                warn!("Ignoring unreadable settings {}: {}", path.display(), e);
                RuntimeSettings::default()
            }
        };

        Self {
            path,
            current: RwLock::new(current),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> RuntimeSettings {
        self.current.read().await.clone()
    }

    /// User selection for a capability type, if any.
    pub async fn selection(&self, capability: CapabilityType) -> Option<String> {
        self.current
            .read()
            .await
            .active_extensions
            .get(&capability)
            .cloned()
    }

    pub async fn is_disabled(&self, name: &str) -> bool {
        self.current.read().await.disabled_extensions.contains(name)
    }

    /// Persist `name` as the selected extension for `capability`.
    pub async fn set_active(&self, capability: CapabilityType, name: &str) -> Result<RuntimeSettings> {
        info!("Selecting {} for capability {}", name, capability);
        self.update(|s| {
            s.active_extensions.insert(capability, name.to_string()).as_deref() != Some(name)
        })
        .await
    }

    pub async fn set_disabled(&self, name: &str, disabled: bool) -> Result<RuntimeSettings> {
        self.update(|s| {
            if disabled {
                s.disabled_extensions.insert(name.to_string())
            } else {
                s.disabled_extensions.remove(name)
            }
        })
        .await
    }

    /// Drop every reference to an uninstalled extension.
    pub async fn forget_extension(&self, name: &str) -> Result<RuntimeSettings> {
        self.update(|s| {
            let before = s.active_extensions.len();
            s.active_extensions.retain(|_, selected| selected != name);
            let removed_selection = s.active_extensions.len() != before;
            s.disabled_extensions.remove(name) || removed_selection
        })
        .await
    }

    /// Apply `change`; when it reports a modification, persist and publish.
    async fn update<F>(&self, change: F) -> Result<RuntimeSettings>
    where
        F: FnOnce(&mut RuntimeSettings) -> bool,
    {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        if !change(&mut next) {
            return Ok(next);
        }

        atomic_write_json(&self.path, &next, true)?;
        *current = next.clone();
        drop(current);

        self.events.publish(BridgeEvent::SettingsChanged {
            settings: next.clone(),
        });
        Ok(next)
    }
}
