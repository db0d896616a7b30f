use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ClusterClient, ClusterObject, Labels, api_error};

type Key = (String, String, String);

/// In-process [`ClusterClient`] with the API server semantics the deployer
/// relies on: generated names, resource versions, generations, finalizers
/// and merge patches. Creation timestamps advance one second per write so
/// that ordering by creation time is deterministic.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    store: Arc<Mutex<Store>>,
}

struct Store {
    objects: BTreeMap<Key, Value>,
    sequence: u64,
    epoch: DateTime<Utc>,
    token_controller: bool,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            objects: BTreeMap::new(),
            sequence: 0,
            epoch: Utc::now(),
            token_controller: false,
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates service account token secrets on creation, like the
    /// token controller of a real cluster.
    pub fn with_token_controller(self) -> Self {
        self.lock().token_controller = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn kind_of<K: ClusterObject>() -> String {
    K::kind(&()).to_string()
}

fn decode<K: ClusterObject>(value: &Value) -> Result<K, kube::Error> {
    serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError)
}

fn encode<K: ClusterObject>(object: &K) -> Result<Value, kube::Error> {
    serde_json::to_value(object).map_err(kube::Error::SerdeError)
}

fn not_found(kind: &str, name: &str) -> kube::Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, name))
}

fn metadata_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.get("metadata").is_some_and(Value::is_object) {
        value["metadata"] = Value::Object(Map::new());
    }
    match value.get_mut("metadata") {
        Some(Value::Object(map)) => map,
        _ => unreachable!("metadata was set to an object above"),
    }
}

fn meta_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get("metadata")?.get(field)?.as_str()
}

fn has_finalizers(value: &Value) -> bool {
    value
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn labels_match(value: &Value, labels: &Labels) -> bool {
    let actual = value.get("metadata").and_then(|m| m.get("labels"));
    labels
        .iter()
        .all(|(k, v)| actual.and_then(|l| l.get(k)).and_then(Value::as_str) == Some(v))
}

/// RFC 7386 JSON merge patch.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl Store {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn timestamp(&self, seq: u64) -> String {
        let at = self.epoch + chrono::Duration::seconds(seq as i64);
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn insert(
        &mut self,
        kind: &str,
        namespace: &str,
        mut value: Value,
    ) -> Result<Value, kube::Error> {
        let seq = self.next();
        let creation = self.timestamp(seq);
        let token_controller = self.token_controller;

        let meta = metadata_mut(&mut value);
        let name = match meta.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => match meta.get("generateName").and_then(Value::as_str) {
                Some(prefix) if !prefix.is_empty() => {
                    let suffix = uuid::Uuid::new_v4().simple().to_string();
                    format!("{}{}", prefix, &suffix[..5])
                }
                _ => {
                    return Err(api_error(
                        422,
                        "Invalid",
                        "name or generateName is required".to_string(),
                    ));
                }
            },
        };
        if let Some(ns) = meta.get("namespace").and_then(Value::as_str)
            && !ns.is_empty()
            && ns != namespace
        {
            return Err(api_error(
                400,
                "BadRequest",
                format!("namespace {} does not match the request namespace {}", ns, namespace),
            ));
        }

        let key = (kind.to_string(), namespace.to_string(), name.clone());
        if self.objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", kind, name),
            ));
        }

        meta.insert("name".to_string(), Value::String(name));
        meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
        meta.insert(
            "uid".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
        meta.insert("resourceVersion".to_string(), Value::String(seq.to_string()));
        meta.entry("creationTimestamp")
            .or_insert(Value::String(creation));
        meta.entry("generation").or_insert(Value::from(1));

        if token_controller {
            populate_token(&mut value);
        }
        self.objects.insert(key, value.clone());
        Ok(value)
    }

    /// Applies `change` to the stored object, then bumps the resource version
    /// and drops the object if it is deleting without finalizers.
    fn update<F>(&mut self, key: &Key, change: F) -> Result<Value, kube::Error>
    where
        F: FnOnce(&mut Value) -> Result<(), kube::Error>,
    {
        let seq = self.next();
        let Some(current) = self.objects.get_mut(key) else {
            return Err(not_found(&key.0, &key.2));
        };
        let mut updated = current.clone();
        change(&mut updated)?;
        metadata_mut(&mut updated)
            .insert("resourceVersion".to_string(), Value::String(seq.to_string()));

        let deleting = meta_str(&updated, "deletionTimestamp").is_some();
        if deleting && !has_finalizers(&updated) {
            self.objects.remove(key);
        } else {
            *current = updated.clone();
        }
        Ok(updated)
    }
}

fn check_resource_version(current: &Value, patch: &mut Value) -> Result<(), kube::Error> {
    let requested = patch
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .and_then(|m| m.remove("resourceVersion"));
    if let Some(Value::String(requested)) = requested
        && meta_str(current, "resourceVersion") != Some(requested.as_str())
    {
        return Err(api_error(
            409,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version"
                .to_string(),
        ));
    }
    Ok(())
}

fn populate_token(secret: &mut Value) {
    if secret.get("type").and_then(Value::as_str) != Some("kubernetes.io/service-account-token") {
        return;
    }
    let name = meta_str(secret, "name").unwrap_or_default().to_string();
    let namespace = meta_str(secret, "namespace").unwrap_or_default().to_string();
    if !secret.get("data").is_some_and(Value::is_object) {
        secret["data"] = Value::Object(Map::new());
    }
    let data = &mut secret["data"];
    data["token"] = Value::String(STANDARD.encode(format!("token-{}", name)));
    data["ca.crt"] = Value::String(STANDARD.encode("memory-cluster-ca"));
    data["namespace"] = Value::String(STANDARD.encode(namespace));
}

// Fields owned by the API server survive an apply.
const SERVER_METADATA: [&str; 6] = [
    "uid",
    "creationTimestamp",
    "resourceVersion",
    "generation",
    "deletionTimestamp",
    "finalizers",
];

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, kube::Error> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let store = self.lock();
        store.objects.get(&key).map(decode::<K>).transpose()
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, kube::Error> {
        let kind = kind_of::<K>();
        let store = self.lock();
        store
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
            .filter(|(_, value)| labels_match(value, labels))
            .map(|(_, value)| decode::<K>(value))
            .collect()
    }

    async fn create<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        let mut value = encode(object)?;
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA
                .iter()
                .filter(|f| **f != "finalizers" && **f != "creationTimestamp")
            {
                meta.remove(*field);
            }
        }
        let mut store = self.lock();
        let created = store.insert(&kind_of::<K>(), namespace, value)?;
        decode(&created)
    }

    async fn apply<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        let kind = kind_of::<K>();
        let value = encode(object)?;
        let name = meta_str(&value, "name").unwrap_or_default().to_string();
        let key = (kind.clone(), namespace.to_string(), name);

        let mut store = self.lock();
        if !store.objects.contains_key(&key) {
            let created = store.insert(&kind, namespace, value)?;
            return decode(&created);
        }
        let token_controller = store.token_controller;
        let updated = store.update(&key, |current| {
            let mut next = value.clone();
            let current_meta = current.get("metadata").cloned().unwrap_or_default();
            let meta = metadata_mut(&mut next);
            meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
            for field in SERVER_METADATA {
                match current_meta.get(field) {
                    Some(v) => meta.insert(field.to_string(), v.clone()),
                    None => meta.remove(field),
                };
            }
            if current.get("spec") != next.get("spec") {
                let generation = current_meta
                    .get("generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                metadata_mut(&mut next)
                    .insert("generation".to_string(), Value::from(generation + 1));
            }
            if next.get("status").is_none()
                && let Some(status) = current.get("status")
            {
                next["status"] = status.clone();
            }
            if token_controller {
                populate_token(&mut next);
            }
            *current = next;
            Ok(())
        })?;
        decode(&updated)
    }

    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, kube::Error> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut patch = patch.clone();
        if let Some(map) = patch.as_object_mut() {
            map.remove("status");
        }
        let changes_spec = patch.get("spec").is_some();

        let mut store = self.lock();
        let updated = store.update(&key, |current| {
            check_resource_version(current, &mut patch)?;
            let before = current.get("spec").cloned();
            merge_patch(current, &patch);
            if changes_spec && current.get("spec").cloned() != before {
                let meta = metadata_mut(current);
                let generation = meta.get("generation").and_then(Value::as_i64).unwrap_or(1);
                meta.insert("generation".to_string(), Value::from(generation + 1));
            }
            Ok(())
        })?;
        decode(&updated)
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, kube::Error> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut patch = patch.clone();
        let mut store = self.lock();
        let updated = store.update(&key, |current| {
            check_resource_version(current, &mut patch)?;
            if let Some(status) = patch.get("status") {
                let mut status_patch = Map::new();
                status_patch.insert("status".to_string(), status.clone());
                merge_patch(current, &Value::Object(status_patch));
            }
            Ok(())
        })?;
        decode(&updated)
    }

    async fn delete<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        let key = (kind_of::<K>(), namespace.to_string(), name.to_string());
        let mut store = self.lock();
        let Some(current) = store.objects.get(&key) else {
            return Ok(());
        };
        if !has_finalizers(current) {
            store.objects.remove(&key);
            return Ok(());
        }
        if meta_str(current, "deletionTimestamp").is_none() {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            store.update(&key, |value| {
                metadata_mut(value).insert("deletionTimestamp".to_string(), Value::String(now));
                Ok(())
            })?;
        }
        Ok(())
    }
}
