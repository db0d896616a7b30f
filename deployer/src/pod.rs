//! Execution pods: how they are built, read and cleaned up.

use deployer_defs::{
    COMPONENT_DESCRIPTOR_PATH, COMPONENT_DESCRIPTOR_PATH_ENV, CONFIGURATION_FILENAME,
    CONFIGURATION_PATH, CONFIGURATION_PATH_ENV, CONTENT_PATH, CONTENT_PATH_ENV, Condition,
    ConditionStatus, ContainerImageSpec, ContainerState, ContainerStatus,
    DEPLOY_ITEM_GENERATION_ANNOTATION, DEPLOY_ITEM_NAME_ENV, DEPLOY_ITEM_NAMESPACE_ENV,
    EXPORTS_PATH, EXPORTS_PATH_ENV, IMPORTS_PATH, IMPORTS_PATH_ENV, INIT_CONTAINER_CONDITION,
    INIT_CONTAINER_NAME, JOB_ID_ANNOTATION, MAIN_CONTAINER_NAME, OPERATION_ENV,
    OPERATION_KIND_ANNOTATION, ObjectReference, Operation, POD_FINALIZER, POD_NAME_ENV,
    POD_NAMESPACE_ENV, PodStatus, ProviderConfiguration, REGISTRY_SECRETS_DIR_ENV,
    REGISTRY_SECRETS_PATH, SERVICE_ACCOUNT_MOUNT_PATH, SHARED_BASE_PATH, STATE_PATH, STATE_PATH_ENV,
    STATE_SECRETS_ENV, TARGET_FILENAME, TARGET_PATH, TARGET_PATH_ENV, WAIT_CONTAINER_CONDITION,
    WAIT_CONTAINER_NAME, get_or_init_condition, merge_conditions,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus as K8sContainerStatus, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    LocalObjectReference, ObjectFieldSelector, Pod, PodSpec, SecretVolumeSource, Volume,
    VolumeMount,
};
use kube::api::ObjectMeta;
use log::debug;
use std::collections::BTreeMap;

use crate::cluster::{ClusterClient, Labels, remove_finalizer};
use crate::errors::DeployerError;
use crate::rbac::ServiceAccountTokens;
use crate::secrets::PullSecrets;

/// Waiting reasons that mean an image will never be pulled without a
/// change to the DeployItem.
const IMAGE_PULL_ERRORS: [&str; 5] = [
    "ErrImagePull",
    "InvalidImageName",
    "RegistryUnavailable",
    "ErrImageNeverPull",
    "ImagePullBackOff",
];

const SHARED_VOLUME: &str = "shared";
const INIT_TOKEN_VOLUME: &str = "init-token";
const WAIT_TOKEN_VOLUME: &str = "wait-token";
const CONFIGURATION_VOLUME: &str = "configuration";
const TARGET_VOLUME: &str = "target";
const BLUEPRINT_PULL_SECRET_VOLUME: &str = "blueprint-pull-secret";
const COMPONENT_DESCRIPTOR_PULL_SECRET_VOLUME: &str = "component-descriptor-pull-secret";

/// Everything needed to build an execution pod.
#[derive(Clone, Debug)]
pub struct PodOptions {
    pub deploy_item: ObjectReference,
    /// Host namespace.
    pub namespace: String,
    pub labels: Labels,
    pub generation: i64,
    pub job_id: String,
    pub operation: Operation,
    pub provider_configuration: ProviderConfiguration,
    pub init_container: ContainerImageSpec,
    pub wait_container: ContainerImageSpec,
    pub service_account_tokens: ServiceAccountTokens,
    pub configuration_secret: String,
    pub target_secret: Option<String>,
    pub pull_secrets: PullSecrets,
    /// Recorded state chunks of the previous job.
    pub state_secrets: Vec<String>,
    /// Always pull the sidecar images.
    pub debug: bool,
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn common_env(opts: &PodOptions) -> Vec<EnvVar> {
    vec![
        env(OPERATION_ENV, opts.operation.as_str()),
        env(DEPLOY_ITEM_NAME_ENV, &opts.deploy_item.name),
        env(DEPLOY_ITEM_NAMESPACE_ENV, &opts.deploy_item.namespace),
        env(IMPORTS_PATH_ENV, IMPORTS_PATH),
        env(EXPORTS_PATH_ENV, EXPORTS_PATH),
        env(STATE_PATH_ENV, STATE_PATH),
        env(CONTENT_PATH_ENV, CONTENT_PATH),
        env(COMPONENT_DESCRIPTOR_PATH_ENV, COMPONENT_DESCRIPTOR_PATH),
    ]
}

fn sidecar_env(opts: &PodOptions) -> Vec<EnvVar> {
    let mut vars = common_env(opts);
    vars.push(field_env(POD_NAME_ENV, "metadata.name"));
    vars.push(field_env(POD_NAMESPACE_ENV, "metadata.namespace"));
    vars
}

fn pull_policy(spec: &ContainerImageSpec, debug: bool) -> Option<String> {
    if debug {
        return Some("Always".to_string());
    }
    if spec.image_pull_policy.is_empty() {
        None
    } else {
        Some(spec.image_pull_policy.clone())
    }
}

fn optional_args(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// Builds the execution pod of a DeployItem. The name is generated by the
/// API server from the DeployItem name.
pub fn generate_pod(opts: &PodOptions) -> Pod {
    let shared_mount = mount(SHARED_VOLUME, SHARED_BASE_PATH, false);
    let mut volumes = vec![
        Volume {
            name: SHARED_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        secret_volume(INIT_TOKEN_VOLUME, &opts.service_account_tokens.init),
        secret_volume(WAIT_TOKEN_VOLUME, &opts.service_account_tokens.wait),
        secret_volume(CONFIGURATION_VOLUME, &opts.configuration_secret),
    ];

    let mut init_env = sidecar_env(opts);
    init_env.push(env(
        CONFIGURATION_PATH_ENV,
        &format!("{}/{}", CONFIGURATION_PATH, CONFIGURATION_FILENAME),
    ));
    init_env.push(env(REGISTRY_SECRETS_DIR_ENV, REGISTRY_SECRETS_PATH));
    if !opts.state_secrets.is_empty() {
        init_env.push(env(STATE_SECRETS_ENV, &opts.state_secrets.join(",")));
    }
    let mut init_mounts = vec![
        shared_mount.clone(),
        mount(INIT_TOKEN_VOLUME, SERVICE_ACCOUNT_MOUNT_PATH, true),
        mount(CONFIGURATION_VOLUME, CONFIGURATION_PATH, true),
    ];

    if let Some(target) = &opts.target_secret {
        volumes.push(secret_volume(TARGET_VOLUME, target));
        init_mounts.push(mount(TARGET_VOLUME, TARGET_PATH, true));
        init_env.push(env(
            TARGET_PATH_ENV,
            &format!("{}/{}", TARGET_PATH, TARGET_FILENAME),
        ));
    }
    if let Some(secret) = &opts.pull_secrets.blueprint {
        volumes.push(secret_volume(BLUEPRINT_PULL_SECRET_VOLUME, secret));
        init_mounts.push(mount(
            BLUEPRINT_PULL_SECRET_VOLUME,
            &format!("{}/blueprint", REGISTRY_SECRETS_PATH),
            true,
        ));
    }
    if let Some(secret) = &opts.pull_secrets.component_descriptor {
        volumes.push(secret_volume(COMPONENT_DESCRIPTOR_PULL_SECRET_VOLUME, secret));
        init_mounts.push(mount(
            COMPONENT_DESCRIPTOR_PULL_SECRET_VOLUME,
            &format!("{}/component-descriptor", REGISTRY_SECRETS_PATH),
            true,
        ));
    }

    let init_container = Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(opts.init_container.image.clone()),
        image_pull_policy: pull_policy(&opts.init_container, opts.debug),
        env: Some(init_env),
        volume_mounts: Some(init_mounts),
        ..Default::default()
    };

    let provider = &opts.provider_configuration;
    let main_container = Container {
        name: MAIN_CONTAINER_NAME.to_string(),
        image: Some(provider.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: optional_args(&provider.command),
        args: optional_args(&provider.args),
        env: Some(common_env(opts)),
        volume_mounts: Some(vec![shared_mount.clone()]),
        ..Default::default()
    };

    let wait_container = Container {
        name: WAIT_CONTAINER_NAME.to_string(),
        image: Some(opts.wait_container.image.clone()),
        image_pull_policy: pull_policy(&opts.wait_container, opts.debug),
        env: Some(sidecar_env(opts)),
        volume_mounts: Some(vec![
            shared_mount,
            mount(WAIT_TOKEN_VOLUME, SERVICE_ACCOUNT_MOUNT_PATH, true),
        ]),
        ..Default::default()
    };

    let annotations = BTreeMap::from([
        (
            DEPLOY_ITEM_GENERATION_ANNOTATION.to_string(),
            opts.generation.to_string(),
        ),
        (JOB_ID_ANNOTATION.to_string(), opts.job_id.clone()),
        (
            OPERATION_KIND_ANNOTATION.to_string(),
            opts.operation.as_str().to_string(),
        ),
    ]);

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", opts.deploy_item.name)),
            namespace: Some(opts.namespace.clone()),
            labels: Some(opts.labels.clone()),
            annotations: Some(annotations),
            finalizers: Some(vec![POD_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: Some(vec![init_container]),
            containers: vec![main_container, wait_container],
            volumes: Some(volumes),
            image_pull_secrets: opts.pull_secrets.image.as_ref().map(|name| {
                vec![LocalObjectReference {
                    name: name.clone(),
                }]
            }),
            restart_policy: Some("Never".to_string()),
            automount_service_account_token: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// A pod without a reported phase has not been scheduled yet.
pub fn is_pod_running(pod: &Pod) -> bool {
    matches!(
        pod_phase(pod),
        None | Some("Pending") | Some("Running") | Some("Unknown")
    )
}

pub fn has_pod_finalizer(pod: &Pod) -> bool {
    pod.metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == POD_FINALIZER))
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn pod_generation(pod: &Pod) -> Option<i64> {
    annotation(pod, DEPLOY_ITEM_GENERATION_ANNOTATION).and_then(|g| g.parse().ok())
}

pub fn pod_operation(pod: &Pod) -> Option<Operation> {
    annotation(pod, OPERATION_KIND_ANNOTATION).and_then(Operation::parse)
}

pub fn pod_job_id(pod: &Pod) -> Option<&str> {
    annotation(pod, JOB_ID_ANNOTATION)
}

/// The most recently created pod that still carries the finalizer. Pods
/// created within the same second are ordered by name.
pub fn latest_pod<'a, I>(pods: I) -> Option<&'a Pod>
where
    I: IntoIterator<Item = &'a Pod>,
{
    pods.into_iter().filter(|p| has_pod_finalizer(p)).max_by(|a, b| {
        let created = |p: &Pod| p.metadata.creation_timestamp.as_ref().map(|t| t.0);
        created(a)
            .cmp(&created(b))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    })
}

fn find_container_status<'a>(pod: &'a Pod, name: &str) -> Option<&'a K8sContainerStatus> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .chain(status.container_statuses.iter())
        .flatten()
        .find(|s| s.name == name)
}

/// Fails if any container of the pod waits on an image that cannot be pulled.
pub fn pod_error_state(pod: &Pod) -> Result<(), DeployerError> {
    let Some(status) = pod.status.as_ref() else {
        return Ok(());
    };
    let statuses = status
        .init_container_statuses
        .iter()
        .chain(status.container_statuses.iter())
        .flatten();
    for container in statuses {
        let waiting = container.state.as_ref().and_then(|s| s.waiting.as_ref());
        if let Some(waiting) = waiting
            && let Some(reason) = waiting.reason.as_deref()
            && IMAGE_PULL_ERRORS.contains(&reason)
        {
            return Err(DeployerError::ImagePull {
                container: container.name.clone(),
                reason: reason.to_string(),
                message: waiting.message.clone().unwrap_or_default(),
            });
        }
    }
    Ok(())
}

pub fn convert_container_status(status: &K8sContainerStatus) -> ContainerStatus {
    let mut converted = ContainerStatus {
        name: status.name.clone(),
        image: status.image.clone(),
        image_id: status.image_id.clone(),
        ..Default::default()
    };
    let Some(state) = status.state.as_ref() else {
        return converted;
    };
    if let Some(waiting) = &state.waiting {
        converted.state = ContainerState::Waiting;
        converted.reason = waiting.reason.clone().unwrap_or_default();
        converted.message = waiting.message.clone().unwrap_or_default();
    } else if state.running.is_some() {
        converted.state = ContainerState::Running;
    } else if let Some(terminated) = &state.terminated {
        converted.state = ContainerState::Terminated;
        converted.reason = terminated.reason.clone().unwrap_or_default();
        converted.message = terminated.message.clone().unwrap_or_default();
        converted.exit_code = Some(terminated.exit_code);
    }
    converted
}

/// Snapshot of the pod for the provider status.
pub fn capture_pod_status(pod: &Pod, last_successful_job_id: Option<String>) -> PodStatus {
    let convert = |name: &str| find_container_status(pod, name).map(convert_container_status);
    PodStatus {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        last_run: pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339()),
        last_successful_job_id,
        phase: pod_phase(pod).unwrap_or("Pending").to_string(),
        init_container_status: convert(INIT_CONTAINER_NAME),
        container_status: convert(MAIN_CONTAINER_NAME),
        wait_container_status: convert(WAIT_CONTAINER_NAME),
    }
}

/// Updates the init and wait container conditions from the pod.
pub fn set_conditions_from_pod(pod: &Pod, conditions: &mut Vec<Condition>, now: &str) {
    let sidecars = [
        (INIT_CONTAINER_NAME, INIT_CONTAINER_CONDITION),
        (WAIT_CONTAINER_NAME, WAIT_CONTAINER_CONDITION),
    ];
    for (container, condition_type) in sidecars {
        let Some(state) = find_container_status(pod, container).and_then(|s| s.state.as_ref())
        else {
            continue;
        };
        let condition = get_or_init_condition(conditions, condition_type, now);
        let condition = if let Some(waiting) = &state.waiting {
            condition.updated(
                ConditionStatus::Progressing,
                waiting.reason.as_deref().unwrap_or_default(),
                waiting.message.as_deref().unwrap_or_default(),
                now,
            )
        } else if state.running.is_some() {
            condition.updated(ConditionStatus::Progressing, "Pod running", "", now)
        } else if let Some(terminated) = &state.terminated {
            if terminated.exit_code == 0 {
                condition.updated(
                    ConditionStatus::True,
                    "ContainerSucceeded",
                    "Container terminated successfully",
                    now,
                )
            } else {
                condition.updated(
                    ConditionStatus::False,
                    terminated.reason.as_deref().unwrap_or_default(),
                    terminated.message.as_deref().unwrap_or_default(),
                    now,
                )
            }
        } else {
            continue;
        };
        merge_conditions(conditions, condition);
    }
}

/// Message describing why a failed pod failed, taken from the first
/// container that terminated with a non-zero exit code.
pub fn failure_message(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let failed = status
        .into_iter()
        .flat_map(|s| {
            s.init_container_statuses
                .iter()
                .chain(s.container_statuses.iter())
                .flatten()
        })
        .find_map(|c| {
            let terminated = c.state.as_ref()?.terminated.as_ref()?;
            (terminated.exit_code != 0).then(|| {
                format!(
                    "container {} exited with code {}: {}",
                    c.name,
                    terminated.exit_code,
                    terminated
                        .message
                        .as_deref()
                        .or(terminated.reason.as_deref())
                        .unwrap_or("no message")
                )
            })
        });
    failed.unwrap_or_else(|| {
        status
            .and_then(|s| s.message.clone())
            .unwrap_or_else(|| "pod failed".to_string())
    })
}

/// Releases the pod and deletes it unless it should be kept for debugging.
pub async fn cleanup_pod<C: ClusterClient>(
    host: &C,
    pod: &Pod,
    keep_pod: bool,
) -> Result<(), DeployerError> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    let Some(current) = host.get::<Pod>(&namespace, &name).await? else {
        return Ok(());
    };
    remove_finalizer(host, &current, POD_FINALIZER).await?;
    if !keep_pod {
        host.delete::<Pod>(&namespace, &name).await?;
    }
    debug!("cleaned up pod {}/{} (kept: {})", namespace, name, keep_pod);
    Ok(())
}
