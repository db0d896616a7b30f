use kube::CustomResource;
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Condition, OPERATION_ANNOTATION};

/// Reference to a namespaced object.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct ObjectReference {
    pub name: String,
    pub namespace: String,
}

impl ObjectReference {
    pub fn new(name: &str, namespace: &str) -> Self {
        ObjectReference {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Free-form object, the API server keeps whatever fields it is given.
fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schema.extensions.insert("nullable".to_string(), serde_json::Value::Bool(true));
    Schema::Object(schema)
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "core.orchestrator.dev",
    version = "v1alpha1",
    kind = "DeployItem",
    plural = "deployitems",
    namespaced,
    status = "DeployItemStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemSpec {
    /// Deployer type, only "container" items are handled here.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectReference>,
    /// Raw provider configuration, decoded into a `ProviderConfiguration`.
    #[serde(default)]
    #[schemars(schema_with = "raw_object_schema")]
    pub configuration: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registry_pull_secrets: Vec<ObjectReference>,
    /// Humantime duration, e.g. "10m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DeployItemPhase {
    Init,
    Progressing,
    Succeeded,
    Failed,
    Deleting,
}

impl DeployItemPhase {
    pub fn is_final(&self) -> bool {
        matches!(self, DeployItemPhase::Succeeded | DeployItemPhase::Failed)
    }
}

impl fmt::Display for DeployItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            DeployItemPhase::Init => "Init",
            DeployItemPhase::Progressing => "Progressing",
            DeployItemPhase::Succeeded => "Succeeded",
            DeployItemPhase::Failed => "Failed",
            DeployItemPhase::Deleting => "Deleting",
        };
        write!(f, "{}", phase)
    }
}

// Optional fields are serialized as null so that a merge patch of the whole
// status clears them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemStatus {
    #[serde(default)]
    pub phase: Option<DeployItemPhase>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default, rename = "jobID")]
    pub job_id: Option<String>,
    #[serde(default, rename = "jobIDFinished")]
    pub job_id_finished: Option<String>,
    #[serde(default)]
    #[schemars(schema_with = "raw_object_schema")]
    pub provider_status: Option<serde_json::Value>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub export_ref: Option<ObjectReference>,
    #[serde(default)]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub phase_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub operation: String,
    pub reason: String,
    pub message: String,
    #[serde(default)]
    pub codes: Vec<String>,
    pub last_update_time: String,
}

/// Operation requested through the operation annotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedOperation {
    Reconcile,
    ForceCleanup,
}

impl DeployItem {
    pub fn reference(&self) -> ObjectReference {
        ObjectReference {
            name: self.metadata.name.clone().unwrap_or_default(),
            namespace: self.metadata.namespace.clone().unwrap_or_default(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    pub fn phase(&self) -> Option<DeployItemPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.job_id.as_deref())
    }

    pub fn requested_operation(&self) -> Option<RequestedOperation> {
        let value = self.metadata.annotations.as_ref()?.get(OPERATION_ANNOTATION)?;
        match value.as_str() {
            crate::RECONCILE_OPERATION => Some(RequestedOperation::Reconcile),
            crate::FORCE_CLEANUP_OPERATION => Some(RequestedOperation::ForceCleanup),
            _ => None,
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }
}

/// Credentials of a cluster a deployment targets, passed to the init container.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "core.orchestrator.dev",
    version = "v1alpha1",
    kind = "Target",
    plural = "targets",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub config: serde_json::Value,
}
