//! Logical service names.

use crate::error::PlexusError;
use crate::extension::CapabilityType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Operations an extension can provide. The set is closed; the string form
/// is what crosses the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceName {
    CreateConversation,
    ListConversations,
    GetConversation,
    DeleteConversation,
    AddMessage,
    GetMessages,
    InferenceLoadModel,
    InferenceUnloadModel,
    InferenceStatus,
    InferenceComplete,
    MonitoringResourcesInfo,
    MonitoringCurrentLoad,
    DownloadStart,
    DownloadAbort,
    ModelDownload,
    ModelCancelDownload,
    ModelDelete,
    ModelSave,
    ModelList,
    ModelListDownloaded,
}

impl ServiceName {
    pub const ALL: [ServiceName; 20] = [
        ServiceName::CreateConversation,
        ServiceName::ListConversations,
        ServiceName::GetConversation,
        ServiceName::DeleteConversation,
        ServiceName::AddMessage,
        ServiceName::GetMessages,
        ServiceName::InferenceLoadModel,
        ServiceName::InferenceUnloadModel,
        ServiceName::InferenceStatus,
        ServiceName::InferenceComplete,
        ServiceName::MonitoringResourcesInfo,
        ServiceName::MonitoringCurrentLoad,
        ServiceName::DownloadStart,
        ServiceName::DownloadAbort,
        ServiceName::ModelDownload,
        ServiceName::ModelCancelDownload,
        ServiceName::ModelDelete,
        ServiceName::ModelSave,
        ServiceName::ModelList,
        ServiceName::ModelListDownloaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::CreateConversation => "CreateConversation",
            ServiceName::ListConversations => "ListConversations",
            ServiceName::GetConversation => "GetConversation",
            ServiceName::DeleteConversation => "DeleteConversation",
            ServiceName::AddMessage => "AddMessage",
            ServiceName::GetMessages => "GetMessages",
            ServiceName::InferenceLoadModel => "Inference.LoadModel",
            ServiceName::InferenceUnloadModel => "Inference.UnloadModel",
            ServiceName::InferenceStatus => "Inference.Status",
            ServiceName::InferenceComplete => "Inference.Complete",
            ServiceName::MonitoringResourcesInfo => "Monitoring.ResourcesInfo",
            ServiceName::MonitoringCurrentLoad => "Monitoring.CurrentLoad",
            ServiceName::DownloadStart => "Download.Start",
            ServiceName::DownloadAbort => "Download.Abort",
            ServiceName::ModelDownload => "Model.Download",
            ServiceName::ModelCancelDownload => "Model.CancelDownload",
            ServiceName::ModelDelete => "Model.Delete",
            ServiceName::ModelSave => "Model.Save",
            ServiceName::ModelList => "Model.List",
            ServiceName::ModelListDownloaded => "Model.ListDownloaded",
        }
    }

    /// Capability whose active extension serves this name. `None` means the
    /// first registration serves it.
    pub fn capability(&self) -> Option<CapabilityType> {
        match self {
            ServiceName::CreateConversation
            | ServiceName::ListConversations
            | ServiceName::GetConversation
            | ServiceName::DeleteConversation
            | ServiceName::AddMessage
            | ServiceName::GetMessages => Some(CapabilityType::Conversational),
            ServiceName::InferenceLoadModel
            | ServiceName::InferenceUnloadModel
            | ServiceName::InferenceStatus
            | ServiceName::InferenceComplete => Some(CapabilityType::Inference),
            ServiceName::MonitoringResourcesInfo | ServiceName::MonitoringCurrentLoad => {
                Some(CapabilityType::SystemMonitoring)
            }
            ServiceName::ModelDownload
            | ServiceName::ModelCancelDownload
            | ServiceName::ModelDelete
            | ServiceName::ModelSave
            | ServiceName::ModelList
            | ServiceName::ModelListDownloaded => Some(CapabilityType::Model),
            ServiceName::DownloadStart | ServiceName::DownloadAbort => None,
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| PlexusError::UnsupportedOperation(format!("unknown service {}", s)))
    }
}

impl Serialize for ServiceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for name in ServiceName::ALL {
            assert_eq!(name.as_str().parse::<ServiceName>().unwrap(), name);
        }
        assert!("Inference.Train".parse::<ServiceName>().is_err());
    }

    #[test]
    fn test_capability_mapping() {
        assert_eq!(
            ServiceName::AddMessage.capability(),
            Some(CapabilityType::Conversational)
        );
        assert_eq!(
            ServiceName::InferenceComplete.capability(),
            Some(CapabilityType::Inference)
        );
        assert_eq!(
            ServiceName::ModelListDownloaded.capability(),
            Some(CapabilityType::Model)
        );
        assert_eq!(ServiceName::DownloadAbort.capability(), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&ServiceName::MonitoringCurrentLoad).unwrap();
        assert_eq!(json, "\"Monitoring.CurrentLoad\"");
        let back: ServiceName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ServiceName::MonitoringCurrentLoad);
    }
}
