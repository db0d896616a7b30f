//! Periodic cleanup of host objects whose DeployItem is gone, and of pods
//! that are no longer the latest pod of their DeployItem.

use deployer_defs::{Configuration, DEPLOYER_ID_LABEL, DeployItem, ObjectReference};
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterClient, ClusterObject, Labels};
use crate::errors::DeployerError;
use crate::names::deploy_item_from_labels;
use crate::pod::{cleanup_pod, has_pod_finalizer, is_pod_running, latest_pod};

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    pub kept: usize,
    pub failed: usize,
}

pub struct GarbageCollector<C: ClusterClient> {
    control: Arc<C>,
    host: Arc<C>,
    deployer_id: String,
    namespace: String,
    interval: Duration,
    keep_pods: bool,
}

/// Whether the DeployItems seen in one sweep still exist. Lookup failures are
/// not remembered so the next object of the same item tries again.
type ExistenceCache = HashMap<ObjectReference, bool>;

impl<C: ClusterClient> GarbageCollector<C> {
    pub fn new(
        control: Arc<C>,
        host: Arc<C>,
        config: &Configuration,
    ) -> Result<Self, DeployerError> {
        Ok(GarbageCollector {
            control,
            host,
            deployer_id: config.identity.clone(),
            namespace: config.namespace.clone(),
            interval: config.garbage_collection_interval()?,
            keep_pods: config.garbage_collection.keep_pods,
        })
    }

    /// Sweeps every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "starting garbage collection for deployer {} every {:?}",
            self.deployer_id, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("garbage collection stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    info!(
                        "garbage collection deleted {} objects, kept {}, failed {}",
                        report.deleted, report.kept, report.failed
                    );
                }
            }
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let selector = Labels::from([(DEPLOYER_ID_LABEL.to_string(), self.deployer_id.clone())]);
        let mut cache = ExistenceCache::new();
        let mut report = SweepReport::default();

        self.sweep_objects::<ServiceAccount>(&selector, &mut cache, &mut report)
            .await;
        self.sweep_objects::<Role>(&selector, &mut cache, &mut report)
            .await;
        self.sweep_objects::<RoleBinding>(&selector, &mut cache, &mut report)
            .await;
        self.sweep_objects::<Secret>(&selector, &mut cache, &mut report)
            .await;
        self.sweep_pods(&selector, &mut cache, &mut report).await;
        report
    }

    async fn deploy_item_exists(
        &self,
        item: &ObjectReference,
        cache: &mut ExistenceCache,
    ) -> Result<bool, DeployerError> {
        if let Some(exists) = cache.get(item) {
            return Ok(*exists);
        }
        let exists = self
            .control
            .get::<DeployItem>(&item.namespace, &item.name)
            .await?
            .is_some();
        cache.insert(item.clone(), exists);
        Ok(exists)
    }

    async fn sweep_objects<K: ClusterObject>(
        &self,
        selector: &Labels,
        cache: &mut ExistenceCache,
        report: &mut SweepReport,
    ) {
        let kind = K::kind(&());
        let objects: Vec<K> = match self.host.list(&self.namespace, selector).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("unable to list {} objects: {}", kind, e);
                report.failed += 1;
                return;
            }
        };

        for object in objects {
            let meta = object.meta();
            let name = meta.name.clone().unwrap_or_default();
            let Some(item) = deploy_item_from_labels(meta) else {
                debug!("{} {} names no deploy item, skipping", kind, name);
                report.kept += 1;
                continue;
            };
            match self.deploy_item_exists(&item, cache).await {
                Ok(true) => report.kept += 1,
                Ok(false) => match self.host.delete::<K>(&self.namespace, &name).await {
                    Ok(()) => {
                        info!("deleted {} {} of removed deploy item {}", kind, name, item);
                        report.deleted += 1;
                    }
                    Err(e) => {
                        warn!("unable to delete {} {}: {}", kind, name, e);
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!("unable to look up deploy item {} of {} {}: {}", item, kind, name, e);
                    report.failed += 1;
                }
            }
        }
    }

    async fn sweep_pods(
        &self,
        selector: &Labels,
        cache: &mut ExistenceCache,
        report: &mut SweepReport,
    ) {
        let pods: Vec<Pod> = match self.host.list(&self.namespace, selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("unable to list pods: {}", e);
                report.failed += 1;
                return;
            }
        };

        for pod in &pods {
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            if is_pod_running(pod) {
                report.kept += 1;
                continue;
            }
            let Some(item) = deploy_item_from_labels(&pod.metadata) else {
                report.kept += 1;
                continue;
            };
            let exists = match self.deploy_item_exists(&item, cache).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!("unable to look up deploy item {} of pod {}: {}", item, name, e);
                    report.failed += 1;
                    continue;
                }
            };

            if !has_pod_finalizer(pod) {
                if self.keep_pods {
                    report.kept += 1;
                    continue;
                }
                match self.host.delete::<Pod>(&self.namespace, name).await {
                    Ok(()) => {
                        debug!("deleted released pod {}", name);
                        report.deleted += 1;
                    }
                    Err(e) => {
                        warn!("unable to delete pod {}: {}", name, e);
                        report.failed += 1;
                    }
                }
                continue;
            }

            if exists {
                let latest = latest_pod(
                    pods.iter()
                        .filter(|p| deploy_item_from_labels(&p.metadata).as_ref() == Some(&item)),
                );
                if latest.is_some_and(|l| l.metadata.name == pod.metadata.name) {
                    report.kept += 1;
                    continue;
                }
            }
            match cleanup_pod(self.host.as_ref(), pod, self.keep_pods).await {
                Ok(()) => {
                    info!("cleaned up outdated pod {} of deploy item {}", name, item);
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("unable to clean up pod {}: {}", name, e);
                    report.failed += 1;
                }
            }
        }
    }
}
