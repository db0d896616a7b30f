//! Access to the control and host clusters.
//!
//! The deployer only talks to Kubernetes through [`ClusterClient`], backed by
//! the API server in production. The `test-util` feature adds `MemoryCluster`,
//! an in-process API server for tests.

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use kube::error::ErrorResponse;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fmt::Debug;

mod kube_cluster;
#[cfg(any(test, feature = "test-util"))]
mod memory;

pub use kube_cluster::KubeCluster;
#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryCluster;

pub type Labels = BTreeMap<String, String>;

/// Namespaced object the deployer reads or writes.
pub trait ClusterObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Returns `None` when the object does not exist.
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str)
    -> Result<Option<K>, kube::Error>;

    /// Lists objects carrying all of the given labels.
    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, kube::Error>;

    /// Creates the object, honoring `metadata.generateName`.
    async fn create<K: ClusterObject>(&self, namespace: &str, object: &K)
    -> Result<K, kube::Error>;

    /// Creates the object or updates it to the given content.
    async fn apply<K: ClusterObject>(&self, namespace: &str, object: &K)
    -> Result<K, kube::Error>;

    /// JSON merge patch of the object.
    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error>;

    /// JSON merge patch of the status subresource.
    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error>;

    /// Deletes the object, a missing object is not an error.
    async fn delete<K: ClusterObject>(&self, namespace: &str, name: &str)
    -> Result<(), kube::Error>;
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

pub(crate) fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

pub fn label_selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Removes `finalizer` from the object. A missing object counts as done.
pub async fn remove_finalizer<K: ClusterObject, C: ClusterClient>(
    client: &C,
    object: &K,
    finalizer: &str,
) -> Result<(), kube::Error> {
    let meta = object.meta();
    let Some(finalizers) = meta.finalizers.as_ref() else {
        return Ok(());
    };
    if !finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let remaining: Vec<String> = finalizers
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    let patch = finalizers_patch(remaining, meta.resource_version.as_ref());
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    match client.patch::<K>(&namespace, &name, &patch).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Adds `finalizer` to the object if it is not present yet.
pub async fn add_finalizer<K: ClusterObject, C: ClusterClient>(
    client: &C,
    object: &K,
    finalizer: &str,
) -> Result<(), kube::Error> {
    let meta = object.meta();
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    let patch = finalizers_patch(finalizers, meta.resource_version.as_ref());
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    client.patch::<K>(&namespace, &name, &patch).await?;
    Ok(())
}

// The resource version makes the API server reject the patch if the list
// changed in the meantime.
fn finalizers_patch(
    finalizers: Vec<String>,
    resource_version: Option<&String>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(rv.clone());
    }
    serde_json::json!({ "metadata": metadata })
}
