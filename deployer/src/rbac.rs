//! Service accounts the init and wait containers run with.
//!
//! Each DeployItem gets an init and a wait service account, a role scoped to
//! the objects that container needs, a binding and a token secret that is
//! mounted into the container.

use deployer_defs::{ObjectReference, SERVICE_ACCOUNT_TOKEN_TYPE};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use log::{debug, info};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::cluster::{ClusterClient, Labels};
use crate::errors::DeployerError;
use crate::names::{
    export_secret_name, init_service_account_name, service_account_token_secret_name,
    wait_service_account_name, with_type,
};

const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
const MAX_TOKEN_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct RbacRequest<'a> {
    pub deploy_item: &'a ObjectReference,
    /// Host namespace the pod runs in.
    pub namespace: &'a str,
    pub labels: &'a Labels,
    /// Pull secrets the init container reads to fetch blueprints and
    /// component descriptors.
    pub init_pull_secrets: Vec<String>,
    /// State chunks recorded by the previous job, restored by the init container.
    pub state_secrets: Vec<String>,
    pub token_wait_timeout: Duration,
}

/// Names of the populated token secrets.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceAccountTokens {
    pub init: String,
    pub wait: String,
}

pub async fn ensure_service_accounts<C: ClusterClient>(
    host: &C,
    request: &RbacRequest<'_>,
) -> Result<ServiceAccountTokens, DeployerError> {
    let init_sa = init_service_account_name(&request.deploy_item.name);
    let wait_sa = wait_service_account_name(&request.deploy_item.name);

    let init = ensure_service_account(host, request, &init_sa, init_rules(request)).await?;
    let wait = ensure_service_account(host, request, &wait_sa, wait_rules(request)).await?;

    wait_for_token(host, request.namespace, &init, request.token_wait_timeout).await?;
    wait_for_token(host, request.namespace, &wait, request.token_wait_timeout).await?;
    Ok(ServiceAccountTokens { init, wait })
}

async fn ensure_service_account<C: ClusterClient>(
    host: &C,
    request: &RbacRequest<'_>,
    name: &str,
    rules: Vec<PolicyRule>,
) -> Result<String, DeployerError> {
    let namespace = request.namespace;
    let meta = |name: &str| ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(request.labels.clone()),
        ..Default::default()
    };

    let service_account = ServiceAccount {
        metadata: meta(name),
        automount_service_account_token: Some(false),
        ..Default::default()
    };
    host.apply(namespace, &service_account).await?;

    let role = Role {
        metadata: meta(name),
        rules: Some(rules),
    };
    host.apply(namespace, &role).await?;

    let binding = RoleBinding {
        metadata: meta(name),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    };
    host.apply(namespace, &binding).await?;

    let token_name = service_account_token_secret_name(name);
    let token_secret = Secret {
        metadata: ObjectMeta {
            name: Some(token_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_type(request.labels.clone(), SERVICE_ACCOUNT_TOKEN_TYPE)),
            annotations: Some(BTreeMap::from([(
                SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    };
    host.apply(namespace, &token_secret).await?;
    debug!("ensured service account {}/{}", namespace, name);
    Ok(token_name)
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str], names: Vec<String>) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        resource_names: if names.is_empty() { None } else { Some(names) },
        ..Default::default()
    }
}

/// The init container reads its pull secrets and the recorded state chunks,
/// each by name.
pub fn init_rules(request: &RbacRequest<'_>) -> Vec<PolicyRule> {
    let names: Vec<String> = request
        .init_pull_secrets
        .iter()
        .chain(&request.state_secrets)
        .cloned()
        .collect();
    // an empty resourceNames list would grant access to every secret
    if names.is_empty() {
        return Vec::new();
    }
    vec![rule("", &["secrets"], &["get"], names)]
}

/// The wait container updates its DeployItem, writes state chunks and the
/// export secret, and watches its own pod.
pub fn wait_rules(request: &RbacRequest<'_>) -> Vec<PolicyRule> {
    let item = request.deploy_item;
    vec![
        rule(
            deployer_defs::API_GROUP,
            &["deployitems", "deployitems/status"],
            &["get", "update"],
            vec![item.name.clone()],
        ),
        rule("", &["secrets"], &["create"], vec![]),
        rule(
            "",
            &["secrets"],
            &["get", "update"],
            vec![export_secret_name(&item.namespace, &item.name)],
        ),
        rule("", &["pods"], &["get"], vec![]),
    ]
}

async fn wait_for_token<C: ClusterClient>(
    host: &C,
    namespace: &str,
    secret_name: &str,
    timeout: Duration,
) -> Result<(), DeployerError> {
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(100);
    loop {
        let secret: Option<Secret> = host.get(namespace, secret_name).await?;
        let populated = secret
            .and_then(|s| s.data)
            .and_then(|d| d.get("token").map(|t| !t.0.is_empty()))
            .unwrap_or(false);
        if populated {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DeployerError::TokenNotReady(secret_name.to_string()));
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(MAX_TOKEN_POLL_INTERVAL);
    }
}

/// Deletes the service accounts, roles, bindings and token secrets of a DeployItem.
pub async fn delete_service_accounts<C: ClusterClient>(
    host: &C,
    namespace: &str,
    deploy_item_name: &str,
) -> Result<(), DeployerError> {
    for name in [
        init_service_account_name(deploy_item_name),
        wait_service_account_name(deploy_item_name),
    ] {
        host.delete::<RoleBinding>(namespace, &name).await?;
        host.delete::<Role>(namespace, &name).await?;
        host.delete::<Secret>(namespace, &service_account_token_secret_name(&name))
            .await?;
        host.delete::<ServiceAccount>(namespace, &name).await?;
    }
    info!(
        "deleted service accounts of deploy item {} in {}",
        deploy_item_name, namespace
    );
    Ok(())
}
