//! Persistence of a DeployItem's state directory.
//!
//! A backup archives the directory into a gzip compressed tar and stores it
//! in one or more secrets of at most 1 MiB each. All chunks of a backup share
//! a batch id; the chunk index and the number of chunks are recorded as
//! annotations. The wait container backs up and records the chunks with
//! [`record_state`], the init container of the next job restores the
//! recorded batch. Both containers are built from their own images and use
//! this module as a library. Batches that are no longer recorded are removed
//! by the deployer with [`remove_stale_batches`] once the pod finished.

use chrono::{DateTime, SecondsFormat, Utc};
use deployer_defs::{
    DeployItem, ObjectReference, ProviderStatus, STATE_COUNT_ANNOTATION, STATE_DATA_KEY,
    STATE_NUM_ANNOTATION, STATE_TIMESTAMP_ANNOTATION, STATE_TYPE, STATE_UUID_ANNOTATION,
    StateStatus,
};
use deployer_utils::{build_tar_gzip, extract_tar_gzip, is_empty_dir};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::cluster::{ClusterClient, Labels, is_not_found};
use crate::errors::DeployerError;
use crate::names::{state_secret_generate_name, with_type};

/// Size limit of a single secret.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Backs up and restores a state directory through secrets in `namespace`.
pub struct State<C: ClusterClient> {
    store: Arc<C>,
    deploy_item: ObjectReference,
    namespace: String,
    labels: Labels,
    path: PathBuf,
    chunk_size: usize,
}

/// A group of chunk secrets sharing a batch id.
struct Batch {
    uuid: String,
    chunks: Vec<(usize, Secret)>,
    expected: Option<usize>,
    created: Option<DateTime<Utc>>,
    timestamp: Option<DateTime<Utc>>,
}

impl Batch {
    /// Complete batches hold chunks 0..n-1, and n equals the recorded count.
    fn is_complete(&self) -> bool {
        let contiguous = self
            .chunks
            .iter()
            .enumerate()
            .all(|(i, (num, _))| i == *num);
        contiguous && self.expected.is_none_or(|n| n == self.chunks.len())
    }

    fn order_key(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, &str) {
        (self.created, self.timestamp, &self.uuid)
    }
}

fn annotation<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn group_batches(secrets: Vec<Secret>) -> Vec<Batch> {
    let mut batches: HashMap<String, Batch> = HashMap::new();
    for secret in secrets {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let Some(uuid) = annotation(&secret, STATE_UUID_ANNOTATION).map(str::to_string) else {
            warn!("state secret {} has no batch id, ignoring it", name);
            continue;
        };
        let Some(num) = annotation(&secret, STATE_NUM_ANNOTATION).and_then(|n| n.parse().ok())
        else {
            warn!("state secret {} has no chunk number, ignoring it", name);
            continue;
        };
        let expected = annotation(&secret, STATE_COUNT_ANNOTATION).and_then(|n| n.parse().ok());
        let timestamp = annotation(&secret, STATE_TIMESTAMP_ANNOTATION)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        let created = secret.metadata.creation_timestamp.as_ref().map(|t| t.0);

        let batch = batches.entry(uuid.clone()).or_insert_with(|| Batch {
            uuid,
            chunks: Vec::new(),
            expected,
            created,
            timestamp,
        });
        batch.created = batch.created.max(created);
        batch.timestamp = batch.timestamp.max(timestamp);
        batch.chunks.push((num, secret));
    }
    let mut batches: Vec<Batch> = batches.into_values().collect();
    for batch in &mut batches {
        batch.chunks.sort_by_key(|(num, _)| *num);
    }
    batches
}

impl<C: ClusterClient> State<C> {
    pub fn new(
        store: Arc<C>,
        deploy_item: ObjectReference,
        namespace: &str,
        labels: Labels,
        path: impl Into<PathBuf>,
    ) -> Self {
        State {
            store,
            deploy_item,
            namespace: namespace.to_string(),
            labels,
            path: path.into(),
            chunk_size: MAX_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn selector(&self) -> Labels {
        with_type(self.labels.clone(), STATE_TYPE)
    }

    /// Archives the state directory into chunk secrets. An empty or missing
    /// directory is not backed up. If a chunk cannot be written, the chunks
    /// already written are removed again.
    pub async fn backup(&self) -> Result<Vec<ObjectReference>, DeployerError> {
        if is_empty_dir(&self.path)? {
            info!("no state to back up for {}", self.deploy_item);
            return Ok(Vec::new());
        }

        let path = self.path.clone();
        let mut archive = tokio::task::spawn_blocking(move || {
            let file = tempfile::tempfile()?;
            let mut file = build_tar_gzip(&path, file)?;
            file.seek(SeekFrom::Start(0))?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| DeployerError::StateTransfer(format!("archiving state failed: {}", e)))??;

        let size = archive.metadata()?.len() as usize;
        let count = size.div_ceil(self.chunk_size);
        let uuid = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        debug!(
            "backing up {} bytes of state for {} in {} chunks",
            size, self.deploy_item, count
        );

        let mut written = Vec::with_capacity(count);
        for num in 0..count {
            let length = self.chunk_size.min(size - num * self.chunk_size);
            let mut chunk = vec![0u8; length];
            let created = match archive.read_exact(&mut chunk) {
                Ok(()) => self.write_chunk(&uuid, num, count, &timestamp, chunk).await,
                Err(e) => Err(e.into()),
            };
            match created {
                Ok(reference) => written.push(reference),
                Err(e) => {
                    self.rollback(&written).await;
                    return Err(DeployerError::StateTransfer(format!(
                        "writing state chunk {} of {} failed: {}",
                        num, count, e
                    )));
                }
            }
        }
        info!(
            "backed up state of {} as batch {} ({} chunks)",
            self.deploy_item, uuid, count
        );
        Ok(written)
    }

    async fn write_chunk(
        &self,
        uuid: &str,
        num: usize,
        count: usize,
        timestamp: &str,
        data: Vec<u8>,
    ) -> Result<ObjectReference, DeployerError> {
        let secret = Secret {
            metadata: ObjectMeta {
                generate_name: Some(state_secret_generate_name(
                    &self.deploy_item.namespace,
                    &self.deploy_item.name,
                )),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.selector()),
                annotations: Some(BTreeMap::from([
                    (STATE_UUID_ANNOTATION.to_string(), uuid.to_string()),
                    (STATE_NUM_ANNOTATION.to_string(), num.to_string()),
                    (STATE_COUNT_ANNOTATION.to_string(), count.to_string()),
                    (STATE_TIMESTAMP_ANNOTATION.to_string(), timestamp.to_string()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                STATE_DATA_KEY.to_string(),
                ByteString(data),
            )])),
            ..Default::default()
        };
        let created = self.store.create(&self.namespace, &secret).await?;
        Ok(ObjectReference::new(
            &created.metadata.name.unwrap_or_default(),
            &self.namespace,
        ))
    }

    async fn rollback(&self, written: &[ObjectReference]) {
        for reference in written {
            if let Err(e) = self
                .store
                .delete::<Secret>(&reference.namespace, &reference.name)
                .await
            {
                warn!("unable to remove partial state chunk {}: {}", reference, e);
            }
        }
    }

    /// Restores the newest complete batch among the recorded chunks into the
    /// state directory. Chunks are read by name, so the restoring container
    /// only needs `get` on exactly these secrets. Returns the id of the
    /// restored batch.
    pub async fn restore(
        &self,
        chunks: &[ObjectReference],
    ) -> Result<Option<String>, DeployerError> {
        let mut secrets = Vec::with_capacity(chunks.len());
        for reference in chunks {
            match self
                .store
                .get::<Secret>(&reference.namespace, &reference.name)
                .await?
            {
                Some(secret) => secrets.push(secret),
                None => warn!("state chunk {} of {} is missing", reference, self.deploy_item),
            }
        }
        let mut batches = group_batches(secrets);
        batches.sort_by(|a, b| b.order_key().cmp(&a.order_key()));

        let Some(newest) = batches.into_iter().find(Batch::is_complete) else {
            if !chunks.is_empty() {
                warn!(
                    "recorded state of {} is incomplete, nothing restored",
                    self.deploy_item
                );
            }
            return Ok(None);
        };

        let mut data = Vec::new();
        for (num, secret) in &newest.chunks {
            let chunk = secret
                .data
                .as_ref()
                .and_then(|d| d.get(STATE_DATA_KEY))
                .ok_or_else(|| {
                    DeployerError::StateTransfer(format!(
                        "chunk {} of batch {} has no data",
                        num, newest.uuid
                    ))
                })?;
            data.extend_from_slice(&chunk.0);
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || extract_tar_gzip(data.as_slice(), &path))
            .await
            .map_err(|e| DeployerError::StateTransfer(format!("extracting state failed: {}", e)))??;
        info!(
            "restored state batch {} of {} into {}",
            newest.uuid,
            self.deploy_item,
            self.path.display()
        );
        Ok(Some(newest.uuid))
    }
}

/// Deletes every state batch selected by `labels` that does not contain one
/// of the `keep` chunks, one task per batch. Returns the number of removed
/// batches.
pub async fn remove_stale_batches<C: ClusterClient>(
    store: Arc<C>,
    namespace: &str,
    labels: &Labels,
    keep: &[ObjectReference],
) -> Result<usize, DeployerError> {
    let secrets: Vec<Secret> = store
        .list(namespace, &with_type(labels.clone(), STATE_TYPE))
        .await?;
    let stale: Vec<Batch> = group_batches(secrets)
        .into_iter()
        .filter(|batch| {
            !batch.chunks.iter().any(|(_, secret)| {
                keep.iter().any(|k| {
                    k.namespace == namespace && secret.metadata.name.as_deref() == Some(&k.name)
                })
            })
        })
        .collect();
    let removed = stale.len();

    let mut tasks = JoinSet::new();
    for batch in stale {
        let store = store.clone();
        let namespace = namespace.to_string();
        tasks.spawn(async move {
            for (_, secret) in &batch.chunks {
                let name = secret.metadata.name.clone().unwrap_or_default();
                if let Err(e) = store.delete::<Secret>(&namespace, &name).await {
                    warn!("unable to remove stale state secret {}: {}", name, e);
                }
            }
            batch.uuid
        });
    }
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(uuid) => debug!("removed stale state batch {}", uuid),
            Err(e) => warn!("state cleanup task failed: {}", e),
        }
    }
    Ok(removed)
}

/// Records the state chunk references in the DeployItem's provider status.
/// Conflicts and transient failures are retried up to `attempts` times.
pub async fn record_state<C: ClusterClient>(
    control: &C,
    deploy_item: &ObjectReference,
    references: Vec<ObjectReference>,
    attempts: usize,
    delay: Duration,
) -> Result<(), DeployerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_record_state(control, deploy_item, &references).await {
            Ok(()) => return Ok(()),
            Err(DeployerError::Kube(e)) if is_not_found(&e) => {
                return Err(DeployerError::NotFound {
                    kind: "DeployItem".to_string(),
                    name: deploy_item.to_string(),
                });
            }
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(
                    "recording state of {} failed (attempt {}): {}",
                    deploy_item, attempt, e
                );
                tokio::time::sleep(delay * attempt as u32).await;
            }
        }
    }
}

async fn try_record_state<C: ClusterClient>(
    control: &C,
    deploy_item: &ObjectReference,
    references: &[ObjectReference],
) -> Result<(), DeployerError> {
    let item: DeployItem = control
        .get(&deploy_item.namespace, &deploy_item.name)
        .await?
        .ok_or_else(|| {
            DeployerError::Kube(crate::cluster::api_error(
                404,
                "NotFound",
                format!("deploy item {} not found", deploy_item),
            ))
        })?;
    let status = item.status.unwrap_or_default();
    let mut provider_status = ProviderStatus::decode(status.provider_status.as_ref())?;
    provider_status.state = Some(StateStatus {
        data: references.to_vec(),
    });
    let patch = serde_json::json!({
        "metadata": { "resourceVersion": item.metadata.resource_version },
        "status": { "providerStatus": provider_status },
    });
    control
        .patch_status::<DeployItem>(&deploy_item.namespace, &deploy_item.name, &patch)
        .await?;
    Ok(())
}
