//! Extension manifest and catalog record types.

use crate::atomic::{atomic_read_json, atomic_write_json};
use crate::config::PathsConfig;
use crate::error::{PlexusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Capability an extension implements. At most one extension per type is
/// active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CapabilityType {
    Inference,
    #[serde(alias = "storage")]
    Conversational,
    Model,
    SystemMonitoring,
    Assistant,
}

impl CapabilityType {
    pub const ALL: [CapabilityType; 5] = [
        CapabilityType::Inference,
        CapabilityType::Conversational,
        CapabilityType::Model,
        CapabilityType::SystemMonitoring,
        CapabilityType::Assistant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityType::Inference => "inference",
            CapabilityType::Conversational => "conversational",
            CapabilityType::Model => "model",
            CapabilityType::SystemMonitoring => "systemMonitoring",
            CapabilityType::Assistant => "assistant",
        }
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityType {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "storage" {
            return Ok(CapabilityType::Conversational);
        }
        CapabilityType::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PlexusError::InvalidParams {
                message: format!("unknown capability type: {}", s),
            })
    }
}

/// Lifecycle hook an extension may ask to have invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationPoint {
    OnLoad,
    OnUnload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallationState {
    /// Ships with the runtime; nothing to install.
    NotRequired,
    /// Known but not installed or disabled by the user.
    NotInstalled,
    Installed,
    Installing,
    /// Package folder exists but its manifest cannot be used.
    Corrupted,
}

/// `manifest.json` of an extension package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_type: Option<CapabilityType>,
    #[serde(default)]
    pub activation_points: Vec<ActivationPoint>,
}

impl ExtensionManifest {
    /// Check the fields an installable manifest must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | '/');
        if !self.name.chars().all(allowed) || self.name.contains("..") {
            return Err(invalid(format!("invalid extension name '{}'", self.name)));
        }
        if !is_single_component(&self.folder_name()) {
            return Err(invalid(format!(
                "extension name '{}' does not map to an install folder",
                self.name
            )));
        }
        semver::Version::parse(&self.version)
            .map_err(|e| invalid(format!("invalid version '{}': {}", self.version, e)))?;
        if self.entrypoint.trim().is_empty() {
            return Err(invalid(format!("extension '{}' has no entrypoint", self.name)));
        }
        Ok(())
    }

    /// Folder name used under the extensions directory.
    ///
    /// Scoped names (`@scope/pkg`) are flattened to `scope-pkg`.
    pub fn folder_name(&self) -> String {
        self.name.trim_start_matches('@').replace('/', "-")
    }

    pub fn declares(&self, point: ActivationPoint) -> bool {
        self.activation_points.contains(&point)
    }

    /// Read `<dir>/manifest.json`.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(PathsConfig::MANIFEST_FILE_NAME);
        let manifest: ExtensionManifest = atomic_read_json(&path)?.ok_or_else(|| {
            invalid(format!("no {} in {}", PathsConfig::MANIFEST_FILE_NAME, dir.display()))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the normalized manifest to `<dir>/manifest.json`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        atomic_write_json(&dir.join(PathsConfig::MANIFEST_FILE_NAME), self, false)
    }
}

/// A non-hidden folder name that stays directly under its parent.
pub(crate) fn is_single_component(folder: &str) -> bool {
    let mut components = Path::new(folder).components();
    !folder.is_empty()
        && !folder.starts_with('.')
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}

fn invalid(message: impl Into<String>) -> PlexusError {
    PlexusError::InvalidManifest {
        message: message.into(),
    }
}

/// Catalog entry for one known extension. Owned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRecord {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entrypoint: String,
    pub capability_type: Option<CapabilityType>,
    pub activation_points: Vec<ActivationPoint>,
    pub active: bool,
    pub installation_state: InstallationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Last activation failure, cleared on a successful load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtensionRecord {
    pub fn from_manifest(
        manifest: &ExtensionManifest,
        installation_state: InstallationState,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            entrypoint: manifest.entrypoint.clone(),
            capability_type: manifest.capability_type,
            activation_points: manifest.activation_points.clone(),
            active: false,
            installation_state,
            path,
            error: None,
        }
    }

    /// Placeholder for a package folder whose manifest could not be read.
    pub fn corrupted(folder: &str, path: PathBuf, error: String) -> Self {
        Self {
            name: folder.to_string(),
            version: String::new(),
            description: None,
            entrypoint: String::new(),
            capability_type: None,
            activation_points: Vec::new(),
            active: false,
            installation_state: InstallationState::Corrupted,
            path: Some(path),
            error: Some(error),
        }
    }

    /// Whether `load()` may activate this record.
    pub fn is_loadable(&self) -> bool {
        matches!(
            self.installation_state,
            InstallationState::Installed | InstallationState::NotRequired
        )
    }

    pub fn declares(&self, point: ActivationPoint) -> bool {
        self.activation_points.contains(&point)
    }
}

/// Per-package outcome of `install`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub name: String,
    pub installation_state: InstallationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest() -> ExtensionManifest {
        ExtensionManifest {
            name: "@acme/llama-extension".into(),
            version: "1.2.0".into(),
            description: Some("llama.cpp backend".into()),
            entrypoint: "builtin:inference".into(),
            capability_type: Some(CapabilityType::Inference),
            activation_points: vec![ActivationPoint::OnLoad, ActivationPoint::OnUnload],
        }
    }

    #[test]
    fn test_manifest_json_is_camel_case() {
        let json = serde_json::to_value(manifest()).unwrap();
        assert_eq!(json["capabilityType"], "inference");
        assert_eq!(json["activationPoints"][0], "onLoad");
    }

    #[test]
    fn test_storage_alias() {
        let m: ExtensionManifest = serde_json::from_str(
            r#"{"name":"s","version":"0.1.0","entrypoint":"x","capabilityType":"storage"}"#,
        )
        .unwrap();
        assert_eq!(m.capability_type, Some(CapabilityType::Conversational));
        assert!(m.activation_points.is_empty());
        assert_eq!(
            "storage".parse::<CapabilityType>().unwrap(),
            CapabilityType::Conversational
        );
    }

    #[test]
    fn test_validate() {
        assert!(manifest().validate().is_ok());

        let mut m = manifest();
        m.version = "latest".into();
        assert!(matches!(m.validate(), Err(PlexusError::InvalidManifest { .. })));

        let mut m = manifest();
        m.name = "../escape".into();
        assert!(m.validate().is_err());

        let mut m = manifest();
        m.entrypoint = " ".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_folder_name_flattens_scope() {
        assert_eq!(manifest().folder_name(), "acme-llama-extension");
    }

    #[test]
    fn test_names_without_an_install_folder_are_rejected() {
        for name in ["@", "@@", ".", "@.hidden"] {
            let mut m = manifest();
            m.name = name.into();
            assert!(
                matches!(m.validate(), Err(PlexusError::InvalidManifest { .. })),
                "{} should be rejected",
                name
            );
        }

        let mut m = manifest();
        m.name = "plain-name".into();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_write_then_read_preserves_identity() {
        let dir = TempDir::new().unwrap();
        let m = manifest();
        m.write_to(dir.path()).unwrap();

        let back = ExtensionManifest::read_from(dir.path()).unwrap();
        assert_eq!(back.name, m.name);
        assert_eq!(back.capability_type, m.capability_type);
        assert_eq!(back.activation_points, m.activation_points);
    }

    #[test]
    fn test_missing_manifest_is_invalid() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ExtensionManifest::read_from(dir.path()),
            Err(PlexusError::InvalidManifest { .. })
        ));
    }
}
