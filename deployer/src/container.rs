//! The container deployer: drives a DeployItem through its execution pods.
//!
//! Every call looks at the latest pod of the DeployItem and moves the item one
//! step further: it launches a pod when a new job is requested, tracks the
//! running pod and records the result once the pod terminated.

use deployer_defs::{
    Configuration, DEPLOY_ITEM_FINALIZER, DeployItem, DeployItemPhase, DeployItemStatus, LastError,
    OPERATION_ANNOTATION, ObjectReference, Operation, ProviderConfiguration, ProviderStatus,
    RequestedOperation, parse_duration,
};
use deployer_utils::{elapsed_since, get_timestamp};
use k8s_openapi::api::core::v1::{Pod, Secret};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{ClusterClient, add_finalizer, is_not_found, remove_finalizer};
use crate::errors::{DeployerError, ErrorCode, ResultExt};
use crate::names::{default_labels, deploy_item_selector, export_secret_name};
use crate::pod::{
    PodOptions, capture_pod_status, cleanup_pod, failure_message, generate_pod, is_pod_running,
    latest_pod, pod_error_state, pod_generation, pod_job_id, pod_operation, pod_phase,
    set_conditions_from_pod,
};
use crate::rbac::{RbacRequest, delete_service_accounts, ensure_service_accounts};
use crate::secrets::{
    BlueprintResolver, build_keyring, sync_configuration, sync_export, sync_pull_secrets,
    sync_target,
};
use crate::state::remove_stale_batches;

pub struct ContainerDeployer<C: ClusterClient> {
    control: Arc<C>,
    host: Arc<C>,
    config: Arc<Configuration>,
    resolver: Option<Arc<dyn BlueprintResolver>>,
}

fn operation_name(operation: Operation) -> &'static str {
    match operation {
        Operation::Reconcile => "Reconcile",
        Operation::Delete => "Delete",
    }
}

fn active_phase(operation: Operation) -> DeployItemPhase {
    match operation {
        Operation::Reconcile => DeployItemPhase::Progressing,
        Operation::Delete => DeployItemPhase::Deleting,
    }
}

/// Whether the pod was started for the job currently requested on the item.
fn is_current_pod(
    item: &DeployItem,
    status: &DeployItemStatus,
    pod: &Pod,
    operation: Operation,
) -> bool {
    pod_generation(pod) == Some(item.generation())
        && pod_job_id(pod) == status.job_id.as_deref()
        && pod_operation(pod) == Some(operation)
}

/// A new pod is only started while the item waits in `Init` for a job that
/// has not succeeded yet. A delete additionally starts a pod when the last
/// operation was not a delete.
pub fn should_run_new_pod(
    item: &DeployItem,
    status: &DeployItemStatus,
    provider_status: &ProviderStatus,
    pod: Option<&Pod>,
    operation: Operation,
) -> bool {
    if pod.is_some_and(|p| is_current_pod(item, status, p, operation)) {
        return false;
    }
    let job_id = status.job_id.as_deref();
    let pending_job = status.phase == Some(DeployItemPhase::Init)
        && (job_id.is_none() || provider_status.last_successful_job_id() != job_id);
    match operation {
        Operation::Reconcile => pending_job,
        Operation::Delete => {
            provider_status.last_operation != Some(Operation::Delete) || pending_job
        }
    }
}

fn encode_provider_status(
    provider_status: &ProviderStatus,
    operation: &str,
) -> Result<serde_json::Value, DeployerError> {
    serde_json::to_value(provider_status).wrap_err(operation, "EncodeProviderStatus")
}

impl<C: ClusterClient> ContainerDeployer<C> {
    pub fn new(control: Arc<C>, host: Arc<C>, config: Arc<Configuration>) -> Self {
        ContainerDeployer {
            control,
            host,
            config,
            resolver: None,
        }
    }

    pub fn with_blueprint_resolver(mut self, resolver: Arc<dyn BlueprintResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Runs one reconcile step for the DeployItem and returns the phase it
    /// ended in, `None` if the item is gone.
    pub async fn reconcile(
        &self,
        item: &DeployItem,
    ) -> Result<Option<DeployItemPhase>, DeployerError> {
        let Some(item) = self.fetch(item, "Reconcile").await? else {
            return Ok(None);
        };
        let status = self.run(&item, Operation::Reconcile).await?;
        Ok(status.phase)
    }

    /// Runs one delete step. Resources are only torn down once the delete pod
    /// succeeded, or right away when a force cleanup was requested.
    pub async fn delete(&self, item: &DeployItem) -> Result<(), DeployerError> {
        let Some(item) = self.fetch(item, "Delete").await? else {
            return Ok(());
        };
        if item.requested_operation() == Some(RequestedOperation::ForceCleanup) {
            return self.teardown(&item).await;
        }
        let status = self.run(&item, Operation::Delete).await?;
        let provider_status = ProviderStatus::decode(status.provider_status.as_ref())
            .wrap_err("Delete", "ParseProviderStatus")?;
        if status.phase == Some(DeployItemPhase::Succeeded)
            && provider_status.last_operation == Some(Operation::Delete)
        {
            self.teardown(&item).await?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        item: &DeployItem,
        operation: &str,
    ) -> Result<Option<DeployItem>, DeployerError> {
        let reference = item.reference();
        let fresh = self
            .control
            .get::<DeployItem>(&reference.namespace, &reference.name)
            .await
            .wrap_err(operation, "FetchDeployItem")?;
        if fresh.is_none() {
            debug!("deploy item {} is gone", reference);
        }
        Ok(fresh)
    }

    async fn run(
        &self,
        item: &DeployItem,
        operation: Operation,
    ) -> Result<DeployItemStatus, DeployerError> {
        let result = match self.check_timeout(item, operation).await {
            Ok(()) => self.execute(item, operation).await,
            Err(e) => Err(e),
        };
        if let Err(err) = &result {
            self.record_error(item, err).await;
        }
        result
    }

    fn timeout(&self, item: &DeployItem) -> Result<Duration, DeployerError> {
        let timeout = match item.spec.timeout.as_deref() {
            Some(value) => parse_duration("timeout", value)?,
            None => self.config.default_timeout()?,
        };
        Ok(timeout)
    }

    /// Fails the item once the current job ran longer than its timeout.
    async fn check_timeout(
        &self,
        item: &DeployItem,
        operation: Operation,
    ) -> Result<(), DeployerError> {
        let op = operation_name(operation);
        if item.phase().is_none_or(|p| p.is_final()) {
            return Ok(());
        }
        let Some(elapsed) = item
            .status
            .as_ref()
            .and_then(|s| s.phase_transition_time.as_deref())
            .and_then(elapsed_since)
        else {
            return Ok(());
        };
        let timeout = self.timeout(item).wrap_err(op, "CheckTimeout")?;
        if elapsed <= timeout {
            return Ok(());
        }

        let reference = item.reference();
        warn!("deploy item {} exceeded its timeout of {:?}", reference, timeout);
        match self
            .host
            .list::<Pod>(&self.config.namespace, &deploy_item_selector(&reference))
            .await
        {
            Ok(pods) => {
                if let Some(pod) = latest_pod(pods.iter())
                    && let Err(e) =
                        cleanup_pod(self.host.as_ref(), pod, self.config.debug.keep_pod).await
                {
                    warn!("unable to clean up pod of timed out deploy item {}: {}", reference, e);
                }
            }
            Err(e) => warn!("unable to list pods of timed out deploy item {}: {}", reference, e),
        }
        Err(DeployerError::Timeout { timeout }.wrap(op, "CheckTimeout"))
    }

    async fn execute(
        &self,
        item: &DeployItem,
        operation: Operation,
    ) -> Result<DeployItemStatus, DeployerError> {
        let op = operation_name(operation);
        let reference = item.reference();
        let provider =
            ProviderConfiguration::decode(&item.spec.configuration, &self.config.default_image)
                .wrap_err(op, "ParseProviderConfiguration")?;
        let mut status = item.status.clone().unwrap_or_default();
        let mut provider_status = ProviderStatus::decode(status.provider_status.as_ref())
            .wrap_err(op, "ParseProviderStatus")?;
        let keep_pod = self.config.debug.keep_pod || provider.debug.keep_pod;

        let pods: Vec<Pod> = self
            .host
            .list(&self.config.namespace, &deploy_item_selector(&reference))
            .await
            .wrap_err(op, "FetchPod")?;
        let pod = latest_pod(pods.iter());
        let now = get_timestamp();

        if let Some(pod) = pod.filter(|p| is_pod_running(p)) {
            let current = is_current_pod(item, &status, pod, operation);
            if let Err(err) = pod_error_state(pod) {
                if !current {
                    info!("releasing stale pod of deploy item {}: {}", reference, err);
                    cleanup_pod(self.host.as_ref(), pod, keep_pod)
                        .await
                        .wrap_err(op, "CleanupPod")?;
                    return Ok(status);
                }
                provider_status.pod_status = Some(capture_pod_status(
                    pod,
                    provider_status.last_successful_job_id().map(str::to_string),
                ));
                set_conditions_from_pod(pod, &mut status.conditions, &now);
                status.provider_status = Some(encode_provider_status(&provider_status, op)?);
                self.update_status(&reference, &status)
                    .await
                    .wrap_err(op, "UpdateDeployItemStatus")?;
                cleanup_pod(self.host.as_ref(), pod, keep_pod)
                    .await
                    .wrap_err(op, "CleanupPod")?;
                return Err(err.wrap(op, "CheckPodState"));
            }
            if !current {
                debug!("deploy item {} waits for a previous pod to finish", reference);
                return Ok(status);
            }
            provider_status.pod_status = Some(capture_pod_status(
                pod,
                provider_status.last_successful_job_id().map(str::to_string),
            ));
            set_conditions_from_pod(pod, &mut status.conditions, &now);
            status.phase = Some(active_phase(operation));
            status.provider_status = Some(encode_provider_status(&provider_status, op)?);
            self.update_status(&reference, &status).await.wrap_err(op, "UpdateDeployItemStatus")?;
            return Ok(status);
        }

        if should_run_new_pod(item, &status, &provider_status, pod, operation) {
            return self
                .launch(item, operation, &provider, provider_status, status)
                .await;
        }

        let Some(pod) = pod else {
            debug!("nothing to do for deploy item {}", reference);
            return Ok(status);
        };
        if !is_current_pod(item, &status, pod, operation) {
            debug!("releasing finished pod of a previous job of deploy item {}", reference);
            cleanup_pod(self.host.as_ref(), pod, keep_pod).await.wrap_err(op, "CleanupPod")?;
            return Ok(status);
        }

        let mut last_successful = provider_status.last_successful_job_id().map(str::to_string);
        if pod_phase(pod) == Some("Succeeded") {
            if operation == Operation::Reconcile {
                status.export_ref = sync_export(
                    self.control.as_ref(),
                    self.host.as_ref(),
                    item,
                    &self.config.namespace,
                )
                .await
                .wrap_err(op, "SyncExport")?;
            }
            last_successful = status.job_id.clone();
            status.phase = Some(DeployItemPhase::Succeeded);
            status.last_error = None;
            info!("{} of deploy item {} succeeded", op, reference);
        } else {
            let message = failure_message(pod);
            info!("{} of deploy item {} failed: {}", op, reference, message);
            status.phase = Some(DeployItemPhase::Failed);
            status.last_error = Some(LastError {
                operation: op.to_string(),
                reason: "PodFailed".to_string(),
                message,
                codes: vec![ErrorCode::InternalProblem.as_str().to_string()],
                last_update_time: now.clone(),
            });
        }
        provider_status.last_operation = Some(operation);
        provider_status.pod_status = Some(capture_pod_status(pod, last_successful));
        set_conditions_from_pod(pod, &mut status.conditions, &now);
        status.provider_status = Some(encode_provider_status(&provider_status, op)?);
        status.job_id_finished = status.job_id.clone();
        status.phase_transition_time = Some(now);
        self.update_status(&reference, &status)
            .await
            .wrap_err(op, "UpdateDeployItemStatus")?;
        cleanup_pod(self.host.as_ref(), pod, keep_pod)
            .await
            .wrap_err(op, "CleanupPod")?;
        self.remove_unrecorded_state(&reference, &provider_status).await;
        Ok(status)
    }

    /// Removes state batches the finished job did not record. Failures are
    /// retried after the next job.
    async fn remove_unrecorded_state(
        &self,
        reference: &ObjectReference,
        provider_status: &ProviderStatus,
    ) {
        let recorded = provider_status
            .state
            .as_ref()
            .map(|s| s.data.clone())
            .unwrap_or_default();
        let labels = default_labels(&self.config.identity, reference);
        match remove_stale_batches(self.host.clone(), &self.config.namespace, &labels, &recorded)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!("removed {} stale state batches of {}", removed, reference),
            Err(e) => warn!("unable to remove stale state of {}: {}", reference, e),
        }
    }

    async fn launch(
        &self,
        item: &DeployItem,
        operation: Operation,
        provider: &ProviderConfiguration,
        mut provider_status: ProviderStatus,
        mut status: DeployItemStatus,
    ) -> Result<DeployItemStatus, DeployerError> {
        let op = operation_name(operation);
        let reference = item.reference();
        let namespace = self.config.namespace.as_str();
        let control = self.control.as_ref();
        let host = self.host.as_ref();

        if operation == Operation::Reconcile {
            add_finalizer(control, item, DEPLOY_ITEM_FINALIZER)
                .await
                .wrap_err(op, "AddFinalizer")?;
        }

        let labels = default_labels(&self.config.identity, &reference);
        let configuration_secret =
            sync_configuration(host, &reference, namespace, &labels, &item.spec.configuration)
                .await
                .wrap_err(op, "SyncConfiguration")?;
        let target_secret = sync_target(
            control,
            host,
            &reference,
            namespace,
            &labels,
            item.spec.target.as_ref(),
        )
        .await
        .wrap_err(op, "SyncTarget")?;

        let keyring = build_keyring(control, &self.config.oci.config_files, item, provider).await;
        let pull_secrets = sync_pull_secrets(
            host,
            &reference,
            namespace,
            &labels,
            provider,
            &keyring,
            self.resolver.as_deref(),
        )
        .await
        .wrap_err(op, "ParseAndSyncSecrets")?;

        let state_secrets: Vec<String> = provider_status
            .state
            .iter()
            .flat_map(|s| &s.data)
            .filter(|r| r.namespace == namespace)
            .map(|r| r.name.clone())
            .collect();
        let token_wait_timeout = self
            .config
            .token_wait_timeout()
            .wrap_err(op, "EnsurePodRBAC")?;
        let service_account_tokens = ensure_service_accounts(
            host,
            &RbacRequest {
                deploy_item: &reference,
                namespace,
                labels: &labels,
                init_pull_secrets: pull_secrets.init_secret_names(),
                state_secrets: state_secrets.clone(),
                token_wait_timeout,
            },
        )
        .await
        .wrap_err(op, "EnsurePodRBAC")?;

        let job_id = status.job_id.clone().unwrap_or_default();
        let pod = generate_pod(&PodOptions {
            deploy_item: reference.clone(),
            namespace: namespace.to_string(),
            labels,
            generation: item.generation(),
            job_id: job_id.clone(),
            operation,
            provider_configuration: provider.clone(),
            init_container: self.config.init_container.clone(),
            wait_container: self.config.wait_container.clone(),
            service_account_tokens,
            configuration_secret,
            target_secret,
            pull_secrets,
            state_secrets,
            debug: self.config.debug.keep_pod || provider.debug.keep_pod,
        });
        let pod = host.create(namespace, &pod).await.wrap_err(op, "CreatePod")?;
        info!(
            "created pod {}/{} for job {} ({}) of deploy item {}",
            namespace,
            pod.metadata.name.as_deref().unwrap_or_default(),
            job_id,
            operation,
            reference
        );

        let now = get_timestamp();
        let last_successful = provider_status.last_successful_job_id().map(str::to_string);
        provider_status.last_operation = Some(operation);
        provider_status.pod_status = Some(capture_pod_status(&pod, last_successful));
        status.provider_status = Some(encode_provider_status(&provider_status, op)?);
        status.phase = Some(active_phase(operation));
        status.phase_transition_time = Some(now);
        status.last_error = None;
        self.update_status(&reference, &status)
            .await
            .wrap_err(op, "UpdateDeployItemStatus")?;

        if item.requested_operation() == Some(RequestedOperation::Reconcile) {
            let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: null } } });
            control
                .patch::<DeployItem>(&reference.namespace, &reference.name, &patch)
                .await
                .wrap_err(op, "RemoveReconcileAnnotation")?;
        }
        Ok(status)
    }

    /// Deletes the RBAC objects, host secrets and pods of the item and
    /// releases its finalizer.
    async fn teardown(&self, item: &DeployItem) -> Result<(), DeployerError> {
        let op = "Delete";
        let reference = item.reference();
        let namespace = self.config.namespace.as_str();
        let host = self.host.as_ref();
        let selector = deploy_item_selector(&reference);

        delete_service_accounts(host, namespace, &reference.name)
            .await
            .wrap_err(op, "DeleteRBAC")?;

        let secrets: Vec<Secret> = host
            .list(namespace, &selector)
            .await
            .wrap_err(op, "DeleteSecrets")?;
        // the export is written by the wait container and may lack our labels
        let export = export_secret_name(&reference.namespace, &reference.name);
        let names = secrets
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .filter(|name| *name != export)
            .chain([export.clone()]);
        for name in names {
            host.delete::<Secret>(namespace, &name)
                .await
                .wrap_err(op, "DeleteSecrets")?;
        }

        let pods: Vec<Pod> = host.list(namespace, &selector).await.wrap_err(op, "DeletePods")?;
        for pod in &pods {
            cleanup_pod(host, pod, self.config.debug.keep_pod)
                .await
                .wrap_err(op, "DeletePods")?;
        }

        // status updates since the item was read changed its resource version
        if let Some(current) = self
            .control
            .get::<DeployItem>(&reference.namespace, &reference.name)
            .await
            .wrap_err(op, "RemoveFinalizer")?
        {
            remove_finalizer(self.control.as_ref(), &current, DEPLOY_ITEM_FINALIZER)
                .await
                .wrap_err(op, "RemoveFinalizer")?;
        }
        info!("removed all resources of deploy item {}", reference);
        Ok(())
    }

    async fn update_status(
        &self,
        reference: &ObjectReference,
        status: &DeployItemStatus,
    ) -> Result<(), DeployerError> {
        let patch = json!({ "status": status });
        self.control
            .patch_status::<DeployItem>(&reference.namespace, &reference.name, &patch)
            .await?;
        Ok(())
    }

    /// Stores the error on the item. Fatal errors also fail the item.
    async fn record_error(&self, item: &DeployItem, err: &DeployerError) {
        let reference = item.reference();
        let mut status = json!({ "lastError": err.to_last_error() });
        if err.is_fatal() {
            status["phase"] = json!(DeployItemPhase::Failed);
            status["jobIDFinished"] = json!(item.job_id());
            status["phaseTransitionTime"] = json!(get_timestamp());
        }
        let patch = json!({ "status": status });
        let result = self
            .control
            .patch_status::<DeployItem>(&reference.namespace, &reference.name, &patch)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!("unable to record error on deploy item {}: {}", reference, e),
        }
    }
}
