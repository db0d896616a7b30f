use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DefsError, ObjectReference};

/// Operation a pod runs, handed to the main container via `OPERATION`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[default]
    Reconcile,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Reconcile => "RECONCILE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Operation> {
        match value {
            "RECONCILE" => Some(Operation::Reconcile),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider specific configuration carried in `DeployItem.spec.configuration`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfiguration {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Values written to the imports file of the shared volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_values: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registry_pull_secrets: Vec<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<BlueprintReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_descriptor: Option<ComponentDescriptorReference>,
    #[serde(default)]
    pub debug: DebugOptions,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintReference {
    /// Name of the blueprint resource in the component descriptor.
    pub resource_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescriptorReference {
    pub repository_context: RepositoryContext,
    pub component_name: String,
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryContext {
    #[serde(rename = "type")]
    pub type_: String,
    pub base_url: String,
}

impl ComponentDescriptorReference {
    /// OCI reference the component descriptor is stored under.
    pub fn oci_reference(&self) -> String {
        format!(
            "{}/component-descriptors/{}:{}",
            self.repository_context.base_url.trim_end_matches('/'),
            self.component_name,
            self.version
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugOptions {
    #[serde(default)]
    pub keep_pod: bool,
}

impl ProviderConfiguration {
    /// Decodes the raw configuration and falls back to the default image.
    pub fn decode(raw: &serde_json::Value, default_image: &str) -> Result<Self, DefsError> {
        if raw.is_null() {
            return Err(DefsError::DecodeProviderConfiguration(
                "configuration is missing".to_string(),
            ));
        }
        let mut configuration: ProviderConfiguration = serde_json::from_value(raw.clone())
            .map_err(|e| DefsError::DecodeProviderConfiguration(e.to_string()))?;

        if configuration.image.is_empty() {
            configuration.image = default_image.to_string();
        }
        if configuration.image.is_empty() {
            return Err(DefsError::DecodeProviderConfiguration(
                "no image defined and no default image configured".to_string(),
            ));
        }
        if let Some(secret) = configuration
            .registry_pull_secrets
            .iter()
            .find(|s| s.name.is_empty())
        {
            return Err(DefsError::DecodeProviderConfiguration(format!(
                "registry pull secret in namespace '{}' has no name",
                secret.namespace
            )));
        }
        if let Some(cd) = &configuration.component_descriptor {
            cd.validate()?;
        }
        Ok(configuration)
    }
}

impl ComponentDescriptorReference {
    fn validate(&self) -> Result<(), DefsError> {
        let fields = [
            ("repositoryContext.type", &self.repository_context.type_),
            ("repositoryContext.baseUrl", &self.repository_context.base_url),
            ("componentName", &self.component_name),
            ("version", &self.version),
        ];
        if let Some((field, _)) = fields.iter().find(|(_, value)| value.is_empty()) {
            return Err(DefsError::DecodeProviderConfiguration(format!(
                "component descriptor reference has no {}",
                field
            )));
        }
        Ok(())
    }
}

/// Provider specific status carried in `DeployItem.status.providerStatus`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_status: Option<PodStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateStatus>,
}

impl ProviderStatus {
    pub fn decode(raw: Option<&serde_json::Value>) -> Result<Self, DefsError> {
        match raw {
            None | Some(serde_json::Value::Null) => Ok(ProviderStatus::default()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(DefsError::DecodeProviderStatus)
            }
        }
    }

    pub fn last_successful_job_id(&self) -> Option<&str> {
        self.pod_status
            .as_ref()
            .and_then(|p| p.last_successful_job_id.as_deref())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default, rename = "lastSuccessfulJobID", skip_serializing_if = "Option::is_none")]
    pub last_successful_job_id: Option<String>,
    #[serde(default)]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container_status: Option<ContainerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_status: Option<ContainerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_container_status: Option<ContainerStatus>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContainerState {
    #[default]
    Unknown,
    Waiting,
    Running,
    Terminated,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, rename = "imageID")]
    pub image_id: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// References to the secrets holding the latest state backup.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateStatus {
    #[serde(default)]
    pub data: Vec<ObjectReference>,
}
