use async_trait::async_trait;
use kube::Client as KubeClient;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};

use super::{ClusterClient, ClusterObject, Labels, api_error, is_not_found, label_selector};

/// [`ClusterClient`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: KubeClient,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: KubeClient, field_manager: &str) -> Self {
        KubeCluster {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, kube::Error> {
        self.api::<K>(namespace).get_opt(name).await
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: &str,
        labels: &Labels,
    ) -> Result<Vec<K>, kube::Error> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
    }

    async fn apply<K: ClusterObject>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().ok_or_else(|| {
            api_error(422, "Invalid", "server-side apply needs a name".to_string())
        })?;
        let params = PatchParams::apply(&self.field_manager).force();
        self.api::<K>(namespace)
            .patch(&name, &params, &Patch::Apply(object))
            .await
    }

    async fn patch<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error> {
        self.api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn patch_status<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, kube::Error> {
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn delete<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), kube::Error> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
