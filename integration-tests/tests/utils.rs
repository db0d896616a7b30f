#![allow(dead_code)]

use container_deployer::operator::handle_annotations_and_generation;
use container_deployer::{ClusterClient, ContainerDeployer, MemoryCluster};
use deployer_defs::{
    Configuration, DeployItem, DeployItemSpec, OPERATION_ANNOTATION, ObjectReference,
};
use k8s_openapi::api::core::v1::Pod;
use serde_json::json;
use std::sync::Arc;

pub const HOST_NAMESPACE: &str = "host";
pub const NAMESPACE: &str = "team-a";
pub const DEPLOYER_ID: &str = "deployer-1";

pub struct TestEnv {
    pub control: Arc<MemoryCluster>,
    pub host: Arc<MemoryCluster>,
    pub config: Configuration,
    pub deployer: ContainerDeployer<MemoryCluster>,
}

pub fn test_config() -> Configuration {
    Configuration {
        identity: DEPLOYER_ID.to_string(),
        namespace: HOST_NAMESPACE.to_string(),
        token_wait_timeout: "1s".to_string(),
        ..Default::default()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Configuration) -> Self {
        let control = Arc::new(MemoryCluster::new());
        let host = Arc::new(MemoryCluster::new().with_token_controller());
        let deployer =
            ContainerDeployer::new(control.clone(), host.clone(), Arc::new(config.clone()));
        TestEnv {
            control,
            host,
            config,
            deployer,
        }
    }

    /// Creates a container DeployItem and moves it to `Init` like the
    /// controller does before reconciling.
    pub async fn create_deploy_item(
        &self,
        name: &str,
        configuration: serde_json::Value,
    ) -> DeployItem {
        let mut item = DeployItem::new(
            name,
            DeployItemSpec {
                type_: "container".to_string(),
                configuration,
                ..Default::default()
            },
        );
        item.metadata.namespace = Some(NAMESPACE.to_string());
        let item = self.control.create(NAMESPACE, &item).await.unwrap();
        self.start_job(&item).await
    }

    pub async fn start_job(&self, item: &DeployItem) -> DeployItem {
        let current = self.deploy_item(&item.reference()).await.unwrap();
        handle_annotations_and_generation(self.control.as_ref(), &current)
            .await
            .unwrap();
        self.deploy_item(&item.reference()).await.unwrap()
    }

    pub async fn deploy_item(&self, reference: &ObjectReference) -> Option<DeployItem> {
        self.control
            .get(&reference.namespace, &reference.name)
            .await
            .unwrap()
    }

    pub async fn request_operation(&self, item: &DeployItem, operation: &str) {
        let reference = item.reference();
        let patch = json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: operation } } });
        self.control
            .patch::<DeployItem>(&reference.namespace, &reference.name, &patch)
            .await
            .unwrap();
    }

    /// Requests deletion the way the API server does: the item stays until
    /// its finalizers are removed.
    pub async fn delete_deploy_item(&self, item: &DeployItem) -> DeployItem {
        let reference = item.reference();
        self.control
            .delete::<DeployItem>(&reference.namespace, &reference.name)
            .await
            .unwrap();
        self.deploy_item(&reference).await.unwrap()
    }

    pub async fn pods(&self) -> Vec<Pod> {
        self.host
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap()
    }

    pub async fn single_pod(&self) -> Pod {
        let pods = self.pods().await;
        assert_eq!(pods.len(), 1, "expected exactly one pod");
        pods.into_iter().next().unwrap()
    }

    /// Plays the kubelet and reports a new pod status.
    pub async fn set_pod_status(&self, pod: &Pod, status: serde_json::Value) {
        let name = pod.metadata.name.as_deref().unwrap();
        self.host
            .patch_status::<Pod>(HOST_NAMESPACE, name, &json!({ "status": status }))
            .await
            .unwrap();
    }

    pub async fn finish_pod(&self, pod: &Pod, phase: &str, exit_code: i32) {
        let terminated = |name: &str| {
            let code = if name == "main" { exit_code } else { 0 };
            let (reason, message) = if code == 0 {
                ("Completed", "")
            } else {
                ("Error", "deployment failed")
            };
            json!({
                "name": name,
                "image": format!("{}:latest", name),
                "imageID": format!("sha256:{}", name),
                "ready": false,
                "restartCount": 0,
                "state": {
                    "terminated": { "exitCode": code, "reason": reason, "message": message }
                },
            })
        };
        self.set_pod_status(
            pod,
            json!({
                "phase": phase,
                "initContainerStatuses": [terminated("init")],
                "containerStatuses": [terminated("main"), terminated("wait")],
            }),
        )
        .await;
    }
}

pub fn alpine() -> serde_json::Value {
    json!({ "image": "alpine:3.20", "command": ["sh", "-c"], "args": ["echo done"] })
}
