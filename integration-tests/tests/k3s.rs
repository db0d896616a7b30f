mod utils;

#[cfg(test)]
mod k3s_tests {
    use super::utils::*;
    use container_deployer::operator::handle_annotations_and_generation;
    use container_deployer::pod::has_pod_finalizer;
    use container_deployer::{ClusterClient, ContainerDeployer, KubeCluster};
    use deployer_defs::{
        DEPLOY_ITEM_FINALIZER, DeployItem, DeployItemPhase, DeployItemSpec, OPERATION_ANNOTATION,
        field_manager,
    };
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, ServiceAccount};
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, ListParams, ObjectMeta, PostParams};
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::{Client, Config, CustomResourceExt};
    use pretty_assertions::assert_eq;
    use rustls::crypto::CryptoProvider;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
    use testcontainers_modules::k3s::{K3s, KUBE_SECURE_PORT};
    use tokio::time::sleep;

    struct Cluster {
        client: Client,
        _container: ContainerAsync<K3s>,
        _conf_dir: TempDir,
    }

    async fn start_cluster() -> Cluster {
        let conf_dir = tempfile::tempdir().unwrap();
        let k3s = K3s::default()
            .with_conf_mount(conf_dir.path())
            .with_tag("v1.31.5-k3s1")
            .with_privileged(true)
            .with_userns_mode("host");
        let container = k3s.start().await.unwrap();
        let client = get_kube_client(&container).await.unwrap();

        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.create(&PostParams::default(), &DeployItem::crd())
            .await
            .unwrap();

        let namespaces: Api<Namespace> = Api::all(client.clone());
        for name in [NAMESPACE, HOST_NAMESPACE] {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            namespaces
                .create(&PostParams::default(), &namespace)
                .await
                .unwrap();
        }

        // the CRD has to be established and the host namespace needs its
        // default service account before pods can be created
        let deploy_items: Api<DeployItem> = Api::namespaced(client.clone(), NAMESPACE);
        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), HOST_NAMESPACE);
        for _ in 0..60 {
            let crd_ready = deploy_items.list(&ListParams::default()).await.is_ok();
            let account_ready = matches!(accounts.get_opt("default").await, Ok(Some(_)));
            if crd_ready && account_ready {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }

        Cluster {
            client,
            _container: container,
            _conf_dir: conf_dir,
        }
    }

    async fn get_kube_client(
        container: &ContainerAsync<K3s>,
    ) -> Result<Client, Box<dyn std::error::Error + 'static>> {
        if CryptoProvider::get_default().is_none() {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("Error initializing rustls provider");
        }

        let conf_yaml = container.image().read_kube_config()?;
        let mut config = Kubeconfig::from_yaml(&conf_yaml)?;
        let port = container.get_host_port_ipv4(KUBE_SECURE_PORT).await?;
        config.clusters.iter_mut().for_each(|cluster| {
            if let Some(server) = cluster.cluster.as_mut().and_then(|c| c.server.as_mut()) {
                *server = format!("https://127.0.0.1:{}", port)
            }
        });

        let client_config =
            Config::from_custom_kubeconfig(config, &KubeConfigOptions::default()).await?;
        Ok(Client::try_from(client_config)?)
    }

    fn secret(name: &str, labels: &[(&str, &str)], value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "value".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn deploy_item(name: &str) -> DeployItem {
        let mut item = DeployItem::new(
            name,
            DeployItemSpec {
                type_: "container".to_string(),
                configuration: alpine(),
                ..Default::default()
            },
        );
        item.metadata.namespace = Some(NAMESPACE.to_string());
        item
    }

    #[tokio::test]
    #[ignore = "starts a k3s container"]
    async fn test_kube_cluster_against_k3s() {
        let cluster = start_cluster().await;
        let kube = KubeCluster::new(cluster.client.clone(), &field_manager());

        // server-side apply creates and then takes over the object
        kube.apply(HOST_NAMESPACE, &secret("applied", &[("app", "db")], "one"))
            .await
            .unwrap();
        kube.apply(HOST_NAMESPACE, &secret("applied", &[("app", "db")], "two"))
            .await
            .unwrap();
        let applied: Secret = kube.get(HOST_NAMESPACE, "applied").await.unwrap().unwrap();
        assert_eq!(
            applied.data.unwrap().get("value"),
            Some(&ByteString(b"two".to_vec()))
        );

        kube.create(HOST_NAMESPACE, &secret("other", &[("app", "cache")], "x"))
            .await
            .unwrap();
        let selected: Vec<Secret> = kube
            .list(
                HOST_NAMESPACE,
                &BTreeMap::from([("app".to_string(), "db".to_string())]),
            )
            .await
            .unwrap();
        let names: Vec<_> = selected.into_iter().filter_map(|s| s.metadata.name).collect();
        assert_eq!(names, vec!["applied".to_string()]);

        kube.delete::<Secret>(HOST_NAMESPACE, "applied").await.unwrap();
        kube.delete::<Secret>(HOST_NAMESPACE, "applied").await.unwrap();
        let gone: Option<Secret> = kube.get(HOST_NAMESPACE, "applied").await.unwrap();
        assert!(gone.is_none());

        kube.create(NAMESPACE, &deploy_item("status")).await.unwrap();
        let patched: DeployItem = kube
            .patch_status(
                NAMESPACE,
                "status",
                &json!({ "status": { "phase": DeployItemPhase::Init, "jobID": "job-1" } }),
            )
            .await
            .unwrap();
        assert_eq!(patched.phase(), Some(DeployItemPhase::Init));
        assert_eq!(patched.job_id(), Some("job-1"));
    }

    #[tokio::test]
    #[ignore = "starts a k3s container"]
    async fn test_launch_and_teardown_on_k3s() {
        let cluster = start_cluster().await;
        let kube = Arc::new(KubeCluster::new(cluster.client.clone(), &field_manager()));
        let mut config = test_config();
        config.token_wait_timeout = "60s".to_string();
        let deployer = ContainerDeployer::new(kube.clone(), kube.clone(), Arc::new(config));

        let item = kube.create(NAMESPACE, &deploy_item("db")).await.unwrap();
        assert!(
            handle_annotations_and_generation(kube.as_ref(), &item)
                .await
                .unwrap()
        );
        let phase = deployer.reconcile(&item).await.unwrap();
        assert_eq!(phase, Some(DeployItemPhase::Progressing));

        let pods: Vec<Pod> = kube
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);
        assert!(has_pod_finalizer(&pods[0]));
        let account: Option<ServiceAccount> = kube.get(HOST_NAMESPACE, "db-init").await.unwrap();
        assert!(account.is_some());
        let item: DeployItem = kube.get(NAMESPACE, "db").await.unwrap().unwrap();
        assert!(item.has_finalizer(DEPLOY_ITEM_FINALIZER));

        kube.patch::<DeployItem>(
            NAMESPACE,
            "db",
            &json!({ "metadata": { "annotations": { OPERATION_ANNOTATION: "force-cleanup" } } }),
        )
        .await
        .unwrap();
        kube.delete::<DeployItem>(NAMESPACE, "db").await.unwrap();
        let item: DeployItem = kube.get(NAMESPACE, "db").await.unwrap().unwrap();
        assert!(item.metadata.deletion_timestamp.is_some());
        deployer.delete(&item).await.unwrap();

        let item: Option<DeployItem> = kube.get(NAMESPACE, "db").await.unwrap();
        assert!(item.is_none());
        let account: Option<ServiceAccount> = kube.get(HOST_NAMESPACE, "db-init").await.unwrap();
        assert!(account.is_none());
        let pods: Vec<Pod> = kube
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        // pods terminate gracefully, they only have to be on their way out
        assert!(pods.iter().all(|p| !has_pod_finalizer(p)));
        assert!(pods.iter().all(|p| p.metadata.deletion_timestamp.is_some()));
    }
}
