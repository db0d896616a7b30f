/// API group of the orchestrator resources.
pub const API_GROUP: &str = "core.orchestrator.dev";

/// DeployItem type handled by this deployer.
pub const CONTAINER_DEPLOYER_TYPE: &str = "container";

const PREFIX: &str = "container.deployer.orchestrator.dev";

// Labels written on every object the deployer creates in the host cluster.
pub const DEPLOYER_ID_LABEL: &str = "container.deployer.orchestrator.dev/deployer-id";
pub const NAME_LABEL: &str = "container.deployer.orchestrator.dev/name";
pub const DEPLOY_ITEM_NAME_LABEL: &str = "container.deployer.orchestrator.dev/deployitem-name";
pub const DEPLOY_ITEM_NAMESPACE_LABEL: &str =
    "container.deployer.orchestrator.dev/deployitem-namespace";
pub const TYPE_LABEL: &str = "container.deployer.orchestrator.dev/type";

// Values of TYPE_LABEL.
pub const CONFIGURATION_TYPE: &str = "configuration";
pub const TARGET_TYPE: &str = "target";
pub const REGISTRY_PULL_SECRET_TYPE: &str = "registry-pull-secret";
pub const EXPORT_TYPE: &str = "export";
pub const STATE_TYPE: &str = "state";
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "service-account-token";

// Pod annotations.
pub const DEPLOY_ITEM_GENERATION_ANNOTATION: &str =
    "container.deployer.orchestrator.dev/deployitem-generation";
pub const JOB_ID_ANNOTATION: &str = "container.deployer.orchestrator.dev/job-id";
pub const OPERATION_KIND_ANNOTATION: &str = "container.deployer.orchestrator.dev/operation";

// State chunk annotations.
pub const STATE_UUID_ANNOTATION: &str = "container.deployer.orchestrator.dev/state-uuid";
pub const STATE_NUM_ANNOTATION: &str = "container.deployer.orchestrator.dev/state-num";
pub const STATE_COUNT_ANNOTATION: &str = "container.deployer.orchestrator.dev/state-count";
pub const STATE_TIMESTAMP_ANNOTATION: &str =
    "container.deployer.orchestrator.dev/state-timestamp";
pub const STATE_DATA_KEY: &str = "data";

/// Annotation on a DeployItem requesting an operation from the deployer.
pub const OPERATION_ANNOTATION: &str = "core.orchestrator.dev/operation";
pub const RECONCILE_OPERATION: &str = "reconcile";
pub const FORCE_CLEANUP_OPERATION: &str = "force-cleanup";

/// Finalizer on execution pods; removed once the pod outcome is recorded.
pub const POD_FINALIZER: &str = "container.deployer.orchestrator.dev/finalizer";
/// Finalizer on DeployItems; removed once the host resources are gone.
pub const DEPLOY_ITEM_FINALIZER: &str = "core.orchestrator.dev/container-deployer";

// Container names inside an execution pod.
pub const INIT_CONTAINER_NAME: &str = "init";
pub const MAIN_CONTAINER_NAME: &str = "main";
pub const WAIT_CONTAINER_NAME: &str = "wait";

// Condition types derived from the sidecar containers.
pub const INIT_CONTAINER_CONDITION: &str = "InitContainerSucceeded";
pub const WAIT_CONTAINER_CONDITION: &str = "WaitContainerSucceeded";

// Filesystem layout shared by the containers of a pod.
pub const BASE_PATH: &str = "/deployer";
pub const SHARED_BASE_PATH: &str = "/deployer/shared";
pub const IMPORTS_PATH: &str = "/deployer/shared/imports.json";
pub const EXPORTS_PATH: &str = "/deployer/shared/exports";
pub const STATE_PATH: &str = "/deployer/shared/state";
pub const CONTENT_PATH: &str = "/deployer/shared/content";
pub const COMPONENT_DESCRIPTOR_PATH: &str = "/deployer/shared/component_descriptor.json";
pub const CONFIGURATION_PATH: &str = "/deployer/configuration";
pub const TARGET_PATH: &str = "/deployer/target";
pub const REGISTRY_SECRETS_PATH: &str = "/deployer/registry_secrets";
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

// Keys of the generated secrets.
pub const CONFIGURATION_FILENAME: &str = "configuration.json";
pub const TARGET_FILENAME: &str = "target.json";

// Environment variables injected into the containers.
pub const OPERATION_ENV: &str = "OPERATION";
pub const IMPORTS_PATH_ENV: &str = "IMPORTS_PATH";
pub const EXPORTS_PATH_ENV: &str = "EXPORTS_PATH";
pub const STATE_PATH_ENV: &str = "STATE_PATH";
pub const CONTENT_PATH_ENV: &str = "CONTENT_PATH";
pub const COMPONENT_DESCRIPTOR_PATH_ENV: &str = "COMPONENT_DESCRIPTOR_PATH";
pub const CONFIGURATION_PATH_ENV: &str = "CONFIGURATION_PATH";
pub const TARGET_PATH_ENV: &str = "TARGET_PATH";
pub const REGISTRY_SECRETS_DIR_ENV: &str = "REGISTRY_SECRETS_DIR";
pub const DEPLOY_ITEM_NAME_ENV: &str = "DEPLOY_ITEM_NAME";
pub const DEPLOY_ITEM_NAMESPACE_ENV: &str = "DEPLOY_ITEM_NAMESPACE";
pub const POD_NAME_ENV: &str = "POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Comma separated names of the state chunks the init container restores.
pub const STATE_SECRETS_ENV: &str = "STATE_SECRETS";

/// Field manager used for server-side apply.
pub fn field_manager() -> String {
    format!("{}-controller", PREFIX)
}
