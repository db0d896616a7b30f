//! Names and labels of the objects created in the host cluster.

use deployer_defs::{
    DEPLOY_ITEM_NAME_LABEL, DEPLOY_ITEM_NAMESPACE_LABEL, DEPLOYER_ID_LABEL, NAME_LABEL,
    ObjectReference, TYPE_LABEL,
};
use kube::api::ObjectMeta;

use crate::cluster::Labels;

pub fn configuration_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-config", namespace, name)
}

pub fn target_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-target", namespace, name)
}

/// Secret the wait container writes the exports to.
pub fn export_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-export", namespace, name)
}

pub fn image_pull_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-imgpullsec", namespace, name)
}

pub fn blueprint_pull_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-bppullsec", namespace, name)
}

pub fn component_descriptor_pull_secret_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-cdpullsec", namespace, name)
}

/// Export secret in the DeployItem's own namespace.
pub fn deploy_item_export_secret_name(name: &str) -> String {
    format!("{}-export", name)
}

pub fn init_service_account_name(name: &str) -> String {
    format!("{}-init", name)
}

pub fn wait_service_account_name(name: &str) -> String {
    format!("{}-wait", name)
}

pub fn service_account_token_secret_name(service_account: &str) -> String {
    format!("{}-token", service_account)
}

pub fn state_secret_generate_name(namespace: &str, name: &str) -> String {
    format!("state-{}-{}-", namespace, name)
}

/// Labels identifying the DeployItem a host object belongs to.
pub fn default_labels(deployer_id: &str, deploy_item: &ObjectReference) -> Labels {
    Labels::from([
        (DEPLOYER_ID_LABEL.to_string(), deployer_id.to_string()),
        (NAME_LABEL.to_string(), deploy_item.name.clone()),
        (DEPLOY_ITEM_NAME_LABEL.to_string(), deploy_item.name.clone()),
        (
            DEPLOY_ITEM_NAMESPACE_LABEL.to_string(),
            deploy_item.namespace.clone(),
        ),
    ])
}

/// Selector for all host objects of a DeployItem, regardless of deployer.
pub fn deploy_item_selector(deploy_item: &ObjectReference) -> Labels {
    Labels::from([
        (DEPLOY_ITEM_NAME_LABEL.to_string(), deploy_item.name.clone()),
        (
            DEPLOY_ITEM_NAMESPACE_LABEL.to_string(),
            deploy_item.namespace.clone(),
        ),
    ])
}

pub fn with_type(mut labels: Labels, type_: &str) -> Labels {
    labels.insert(TYPE_LABEL.to_string(), type_.to_string());
    labels
}

pub fn inject_labels(meta: &mut ObjectMeta, labels: &Labels) {
    let existing = meta.labels.get_or_insert_with(Default::default);
    for (k, v) in labels {
        existing.insert(k.clone(), v.clone());
    }
}

/// DeployItem an object belongs to, read from its labels.
pub fn deploy_item_from_labels(meta: &ObjectMeta) -> Option<ObjectReference> {
    let labels = meta.labels.as_ref()?;
    let name = labels.get(DEPLOY_ITEM_NAME_LABEL)?;
    let namespace = labels.get(DEPLOY_ITEM_NAMESPACE_LABEL)?;
    Some(ObjectReference::new(name, namespace))
}
