use deployer_defs::{
    CONTAINER_DEPLOYER_TYPE, Configuration, DEPLOY_ITEM_FINALIZER, DEPLOYER_ID_LABEL, DeployItem,
    DeployItemPhase, OPERATION_ANNOTATION, RequestedOperation, field_manager,
};
use deployer_utils::get_timestamp;
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client as KubeClient};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, KubeCluster};
use crate::container::ContainerDeployer;
use crate::errors::{DeployerError, ResultExt};
use crate::garbage_collector::GarbageCollector;
use crate::names::deploy_item_from_labels;

const PROGRESS_REQUEUE: Duration = Duration::from_secs(60);
const DELETE_REQUEUE: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Context passed to the reconcile function
pub struct Context<C: ClusterClient> {
    deployer: ContainerDeployer<C>,
    control: Arc<C>,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(deployer: ContainerDeployer<C>, control: Arc<C>) -> Self {
        Context { deployer, control }
    }
}

pub async fn start_operator(
    control: KubeClient,
    host: KubeClient,
    config: Configuration,
) -> anyhow::Result<()> {
    config.validate()?;
    let config = Arc::new(config);
    let leadership = create_lease_lock(host.clone(), &config);

    loop {
        let lease = leadership.try_acquire_or_renew().await?;
        if lease.acquired_lease {
            info!("Leadership acquired for deployer {}", config.identity);
            let cancel = CancellationToken::new();
            let controllers = tokio::spawn(run_controllers(
                control.clone(),
                host.clone(),
                config.clone(),
                cancel.clone(),
            ));
            renew_leadership(&leadership, &config.identity).await;
            cancel.cancel();
            match controllers.await {
                Ok(Ok(())) => info!("Controllers stopped"),
                Ok(Err(e)) => error!("Controllers failed: {}", e),
                Err(e) => error!("Controller task panicked: {}", e),
            }
        } else {
            info!("There is already a leader, waiting for it to release leadership");
            time::sleep(Duration::from_secs(15)).await;
        }
    }
}

fn create_lease_lock(client: KubeClient, config: &Configuration) -> LeaseLock {
    LeaseLock::new(
        client,
        &config.namespace,
        LeaseLockParams {
            holder_id: get_holder_id(&config.identity),
            lease_name: format!("{}-lock", config.identity),
            lease_ttl: Duration::from_secs(25),
        },
    )
}

fn get_holder_id(identity: &str) -> String {
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| "NO_POD_NAME_FOUND".into());
    format!("{}-{}", identity, pod_name)
}

async fn renew_leadership(leadership: &LeaseLock, identity: &str) {
    let mut renew_interval = time::interval(Duration::from_secs(10));

    loop {
        renew_interval.tick().await;
        match leadership.try_acquire_or_renew().await {
            Ok(lease) if lease.acquired_lease => debug!("Leadership renewed for {}", identity),
            Ok(_) => {
                warn!("Leadership of {} was taken over", identity);
                break;
            }
            Err(e) => {
                warn!("Lost leadership due to error: {}", e);
                break;
            }
        }
    }
}

/// Runs the DeployItem controller and the garbage collector until `cancel`
/// fires or the controller stream ends.
pub async fn run_controllers(
    control: KubeClient,
    host: KubeClient,
    config: Arc<Configuration>,
    cancel: CancellationToken,
) -> Result<(), DeployerError> {
    let field_manager = field_manager();
    let control_cluster = Arc::new(KubeCluster::new(control.clone(), &field_manager));
    let host_cluster = Arc::new(KubeCluster::new(host.clone(), &field_manager));

    let garbage_collector = if config.garbage_collection.disable {
        None
    } else {
        Some(GarbageCollector::new(
            control_cluster.clone(),
            host_cluster.clone(),
            &config,
        )?)
    };
    let deployer = ContainerDeployer::new(control_cluster.clone(), host_cluster, config.clone());
    let ctx = Arc::new(Context::new(deployer, control_cluster));

    let pods = Api::<Pod>::namespaced(host, &config.namespace);
    let pod_selector = format!("{}={}", DEPLOYER_ID_LABEL, config.identity);
    let deploy_items = Controller::new(Api::<DeployItem>::all(control), WatcherConfig::default())
        .watches(pods, WatcherConfig::default().labels(&pod_selector), |pod: Pod| {
            deploy_item_from_labels(&pod.metadata)
                .map(|item| ObjectRef::new(&item.name).within(&item.namespace))
        })
        .run(
            reconcile_deploy_item::<KubeCluster>,
            error_policy::<KubeCluster>,
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("Reconciled {}", object),
                Err(e) => warn!("Controller error: {}", e),
            }
        });

    let gc_cancel = cancel.child_token();
    let controller = async {
        info!("Starting deploy item controller for deployer {}", config.identity);
        tokio::select! {
            _ = deploy_items => info!("Deploy item controller terminated"),
            _ = cancel.cancelled() => info!("Deploy item controller stopped"),
        }
        gc_cancel.cancel();
    };
    let collector = async {
        match &garbage_collector {
            Some(gc) => gc.run(gc_cancel.clone()).await,
            None => info!("Garbage collection is disabled"),
        }
    };
    tokio::join!(controller, collector);
    Ok(())
}

/// Reconciles one DeployItem of the container type.
pub async fn reconcile_deploy_item<C: ClusterClient>(
    item: Arc<DeployItem>,
    ctx: Arc<Context<C>>,
) -> Result<Action, DeployerError> {
    let reference = item.reference();
    if item.spec.type_ != CONTAINER_DEPLOYER_TYPE {
        debug!("Ignoring deploy item {} of type {}", reference, item.spec.type_);
        return Ok(Action::await_change());
    }

    if item.metadata.deletion_timestamp.is_some() {
        if !item.has_finalizer(DEPLOY_ITEM_FINALIZER) {
            return Ok(Action::await_change());
        }
        info!("Deleting deploy item {}", reference);
        ctx.deployer.delete(&item).await?;
        return Ok(Action::requeue(DELETE_REQUEUE));
    }

    handle_annotations_and_generation(ctx.control.as_ref(), &item).await?;
    match ctx.deployer.reconcile(&item).await? {
        Some(phase) if !phase.is_final() => Ok(Action::requeue(PROGRESS_REQUEUE)),
        _ => Ok(Action::await_change()),
    }
}

/// Starts a new job when a reconcile was requested or the spec changed.
/// Running jobs are not interrupted, the change is picked up once the item
/// reached a final phase.
pub async fn handle_annotations_and_generation<C: ClusterClient>(
    control: &C,
    item: &DeployItem,
) -> Result<bool, DeployerError> {
    let status = item.status.clone().unwrap_or_default();
    let generation_changed = status.observed_generation != Some(item.generation());
    let reconcile_requested = item.requested_operation() == Some(RequestedOperation::Reconcile);
    let new_job = match status.phase {
        None => true,
        Some(DeployItemPhase::Init) => generation_changed,
        Some(phase) if phase.is_final() => generation_changed || reconcile_requested,
        Some(_) => false,
    };
    if !new_job {
        return Ok(false);
    }

    let reference = item.reference();
    let job_id = uuid::Uuid::new_v4().to_string();
    let patch = json!({
        "status": {
            "phase": DeployItemPhase::Init,
            "observedGeneration": item.generation(),
            "jobID": job_id,
            "phaseTransitionTime": get_timestamp(),
            "lastError": null,
        }
    });
    control
        .patch_status::<DeployItem>(&reference.namespace, &reference.name, &patch)
        .await
        .wrap_err("Reconcile", "HandleAnnotationsAndGeneration")?;
    if reconcile_requested {
        let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: null } } });
        control
            .patch::<DeployItem>(&reference.namespace, &reference.name, &patch)
            .await
            .wrap_err("Reconcile", "HandleAnnotationsAndGeneration")?;
    }
    info!(
        "Deploy item {} moved to Init with job {} (generation {})",
        reference,
        job_id,
        item.generation()
    );
    Ok(true)
}

/// Fatal errors already failed the item, only a change can fix them.
pub fn error_policy<C: ClusterClient>(
    item: Arc<DeployItem>,
    error: &DeployerError,
    _ctx: Arc<Context<C>>,
) -> Action {
    if error.is_fatal() {
        error!("Deploy item {} failed: {}", item.reference(), error);
        Action::await_change()
    } else {
        warn!(
            "Reconcile of deploy item {} failed, requeuing in 30s: {}",
            item.reference(),
            error
        );
        Action::requeue(ERROR_REQUEUE)
    }
}
