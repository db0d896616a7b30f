mod utils;

#[cfg(test)]
mod deployer_tests {
    use super::utils::*;
    use container_deployer::ClusterClient;
    use container_deployer::names::default_labels;
    use container_deployer::pod::{pod_generation, pod_job_id, pod_operation};
    use container_deployer::state::{State, record_state};
    use deployer_defs::{
        ConditionStatus, DEPLOY_ITEM_FINALIZER, DeployItem, DeployItemPhase,
        INIT_CONTAINER_CONDITION, ObjectReference, Operation, ProviderStatus,
    };
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
    use k8s_openapi::api::rbac::v1::Role;
    use kube::api::ObjectMeta;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn write_export(env: &TestEnv, item: &DeployItem) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("team-a-db-export".to_string()),
                labels: Some(default_labels(DEPLOYER_ID, &item.reference())),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "exports".to_string(),
                ByteString(br#"{"url":"db.local"}"#.to_vec()),
            )])),
            ..Default::default()
        };
        env.host.create(HOST_NAMESPACE, &secret).await.unwrap();
    }

    /// Runs the item's current job to success.
    async fn run_to_success(env: &TestEnv, item: &DeployItem) {
        env.deployer.reconcile(item).await.unwrap();
        let pod = env.single_pod().await;
        env.finish_pod(&pod, "Succeeded", 0).await;
        let phase = env.deployer.reconcile(item).await.unwrap();
        assert_eq!(phase, Some(DeployItemPhase::Succeeded));
    }

    #[tokio::test]
    async fn test_reconcile_launches_a_single_pod() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        let job_id = item.job_id().unwrap().to_string();

        env.deployer.reconcile(&item).await.unwrap();
        env.deployer.reconcile(&item).await.unwrap();

        let pod = env.single_pod().await;
        assert_eq!(pod_job_id(&pod), Some(job_id.as_str()));
        assert_eq!(pod_operation(&pod), Some(Operation::Reconcile));

        let item = env.deploy_item(&item.reference()).await.unwrap();
        assert_eq!(item.phase(), Some(DeployItemPhase::Progressing));
        assert!(item.has_finalizer(DEPLOY_ITEM_FINALIZER));
        let provider =
            ProviderStatus::decode(item.status.unwrap().provider_status.as_ref()).unwrap();
        assert_eq!(provider.last_operation, Some(Operation::Reconcile));
        assert_eq!(
            provider.pod_status.map(|p| p.pod_name),
            pod.metadata.name.clone()
        );

        let configuration: Option<Secret> = env
            .host
            .get(HOST_NAMESPACE, "team-a-db-config")
            .await
            .unwrap();
        assert!(configuration.is_some());
        let accounts: Vec<ServiceAccount> = env
            .host
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        assert_eq!(accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_successful_job_runs_at_most_once() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        write_export(&env, &item).await;
        let pod = env.single_pod().await;
        env.finish_pod(&pod, "Succeeded", 0).await;

        let phase = env.deployer.reconcile(&item).await.unwrap();
        assert_eq!(phase, Some(DeployItemPhase::Succeeded));
        assert!(env.pods().await.is_empty());

        let item = env.deploy_item(&item.reference()).await.unwrap();
        let status = item.status.clone().unwrap();
        assert_eq!(status.job_id_finished, status.job_id);
        assert_eq!(status.last_error, None);
        assert_eq!(
            status.export_ref,
            Some(ObjectReference::new("db-export", NAMESPACE))
        );
        let init_condition = status
            .conditions
            .iter()
            .find(|c| c.type_ == INIT_CONTAINER_CONDITION)
            .unwrap();
        assert_eq!(init_condition.status, ConditionStatus::True);
        let provider = ProviderStatus::decode(status.provider_status.as_ref()).unwrap();
        assert_eq!(provider.last_successful_job_id(), status.job_id.as_deref());

        let export: Secret = env.control.get(NAMESPACE, "db-export").await.unwrap().unwrap();
        assert_eq!(
            export.data.unwrap().get("exports"),
            Some(&ByteString(br#"{"url":"db.local"}"#.to_vec()))
        );

        // nothing changed, so the same job is not run again
        let item = env.start_job(&item).await;
        assert_eq!(item.job_id(), status.job_id.as_deref());
        env.deployer.reconcile(&item).await.unwrap();
        env.deployer.reconcile(&item).await.unwrap();
        assert!(env.pods().await.is_empty());
    }

    #[tokio::test]
    async fn test_spec_change_starts_a_new_job() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        run_to_success(&env, &item).await;
        let first_job = env
            .deploy_item(&item.reference())
            .await
            .unwrap()
            .job_id()
            .map(str::to_string);

        env.control
            .patch::<DeployItem>(
                NAMESPACE,
                "db",
                &json!({ "spec": { "configuration": { "image": "alpine:3.21" } } }),
            )
            .await
            .unwrap();
        let item = env.start_job(&item).await;
        assert_eq!(item.phase(), Some(DeployItemPhase::Init));
        assert_ne!(item.job_id().map(str::to_string), first_job);

        env.deployer.reconcile(&item).await.unwrap();
        let pod = env.single_pod().await;
        assert_eq!(pod_generation(&pod), Some(2));
        assert_eq!(pod_job_id(&pod), item.job_id());
        let main = pod
            .spec
            .unwrap()
            .containers
            .into_iter()
            .find(|c| c.name == "main")
            .unwrap();
        assert_eq!(main.image.as_deref(), Some("alpine:3.21"));
    }

    #[tokio::test]
    async fn test_image_pull_backoff_fails_fast() {
        let env = TestEnv::new();
        let item = env
            .create_deploy_item("db", json!({ "image": "does-not-exist:latest" }))
            .await;
        env.deployer.reconcile(&item).await.unwrap();
        let pod = env.single_pod().await;
        env.set_pod_status(
            &pod,
            json!({
                "phase": "Pending",
                "initContainerStatuses": [{
                    "name": "init",
                    "image": "container-deployer-init:latest",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "waiting": {
                        "reason": "ImagePullBackOff",
                        "message": "Back-off pulling image",
                    } },
                }],
            }),
        )
        .await;

        let err = env.deployer.reconcile(&item).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(env.pods().await.is_empty());

        let item = env.deploy_item(&item.reference()).await.unwrap();
        assert_eq!(item.phase(), Some(DeployItemPhase::Failed));
        let last_error = item.status.unwrap().last_error.unwrap();
        assert_eq!(last_error.operation, "Reconcile");
        assert_eq!(last_error.reason, "CheckPodState");
        assert_eq!(
            last_error.codes,
            vec![
                "ERR_CONFIGURATION_PROBLEM".to_string(),
                "ERR_IMAGE_PULL".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_pod_fails_the_item() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        let pod = env.single_pod().await;
        env.finish_pod(&pod, "Failed", 1).await;

        let phase = env.deployer.reconcile(&item).await.unwrap();
        assert_eq!(phase, Some(DeployItemPhase::Failed));
        assert!(env.pods().await.is_empty());

        let item = env.deploy_item(&item.reference()).await.unwrap();
        let status = item.status.clone().unwrap();
        let last_error = status.last_error.unwrap();
        assert_eq!(
            last_error.message,
            "container main exited with code 1: deployment failed"
        );
        assert_eq!(status.job_id_finished, status.job_id);

        // a failed job is only retried when a new job is requested
        env.deployer.reconcile(&item).await.unwrap();
        assert!(env.pods().await.is_empty());
        env.request_operation(&item, "reconcile").await;
        let item = env.start_job(&item).await;
        env.deployer.reconcile(&item).await.unwrap();
        assert_eq!(env.pods().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exceeded_timeout_fails_the_item() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        env.control
            .patch_status::<DeployItem>(
                NAMESPACE,
                "db",
                &json!({ "status": { "phaseTransitionTime": "2020-01-01T00:00:00Z" } }),
            )
            .await
            .unwrap();

        let err = env.deployer.reconcile(&item).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(env.pods().await.is_empty());
        let item = env.deploy_item(&item.reference()).await.unwrap();
        assert_eq!(item.phase(), Some(DeployItemPhase::Failed));
        let last_error = item.status.unwrap().last_error.unwrap();
        assert_eq!(last_error.reason, "CheckTimeout");
        assert_eq!(last_error.codes, vec!["ERR_TIMEOUT".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_runs_a_delete_pod_before_teardown() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        write_export(&env, &item).await;
        let pod = env.single_pod().await;
        env.finish_pod(&pod, "Succeeded", 0).await;
        env.deployer.reconcile(&item).await.unwrap();

        let item = env.delete_deploy_item(&item).await;
        assert!(item.metadata.deletion_timestamp.is_some());
        env.deployer.delete(&item).await.unwrap();

        let pod = env.single_pod().await;
        assert_eq!(pod_operation(&pod), Some(Operation::Delete));
        let current = env.deploy_item(&item.reference()).await.unwrap();
        assert_eq!(current.phase(), Some(DeployItemPhase::Deleting));

        // still running, nothing is torn down yet
        env.deployer.delete(&item).await.unwrap();
        assert!(env.deploy_item(&item.reference()).await.is_some());

        env.finish_pod(&pod, "Succeeded", 0).await;
        env.deployer.delete(&item).await.unwrap();

        assert!(env.deploy_item(&item.reference()).await.is_none());
        assert!(env.pods().await.is_empty());
        let accounts: Vec<ServiceAccount> = env
            .host
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        assert!(accounts.is_empty());
        let secrets: Vec<Secret> = env
            .host
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_force_cleanup_skips_the_delete_pod() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        assert_eq!(env.pods().await.len(), 1);

        env.request_operation(&item, "force-cleanup").await;
        let item = env.delete_deploy_item(&item).await;
        env.deployer.delete(&item).await.unwrap();

        assert!(env.deploy_item(&item.reference()).await.is_none());
        assert!(env.pods().await.is_empty());
    }

    async fn backup_state(env: &TestEnv, item: &DeployItem) -> Vec<ObjectReference> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("terraform.tfstate"), b"{}").unwrap();
        State::new(
            env.host.clone(),
            item.reference(),
            HOST_NAMESPACE,
            default_labels(DEPLOYER_ID, &item.reference()),
            dir.path(),
        )
        .backup()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_recorded_state_is_handed_to_the_next_job() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        run_to_success(&env, &item).await;

        let recorded = backup_state(&env, &item).await;
        record_state(
            env.control.as_ref(),
            &item.reference(),
            recorded.clone(),
            3,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        env.request_operation(&item, "reconcile").await;
        let item = env.start_job(&item).await;
        env.deployer.reconcile(&item).await.unwrap();

        let recorded_names: Vec<String> = recorded.iter().map(|r| r.name.clone()).collect();
        let role: Role = env.host.get(HOST_NAMESPACE, "db-init").await.unwrap().unwrap();
        let rules = role.rules.unwrap();
        for rule in &rules {
            let names = rule.resource_names.clone().unwrap_or_default();
            assert!(!names.is_empty(), "init role grants unnamed access");
            assert_eq!(rule.verbs, vec!["get".to_string()]);
        }
        let granted: Vec<String> = rules
            .into_iter()
            .flat_map(|r| r.resource_names.unwrap_or_default())
            .collect();
        for name in &recorded_names {
            assert!(granted.contains(name), "{} is not readable", name);
        }

        let pod = env.single_pod().await;
        let init_containers = pod.spec.clone().unwrap().init_containers.unwrap();
        let init = &init_containers[0];
        let state_env = init
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "STATE_SECRETS")
            .and_then(|e| e.value.clone());
        assert_eq!(state_env, Some(recorded_names.join(",")));

        // an unrecorded batch is dropped once the job finished
        let unrecorded = backup_state(&env, &item).await;
        env.finish_pod(&pod, "Succeeded", 0).await;
        env.deployer.reconcile(&item).await.unwrap();
        for chunk in &recorded {
            let secret: Option<Secret> = env.host.get(HOST_NAMESPACE, &chunk.name).await.unwrap();
            assert!(secret.is_some());
        }
        for chunk in &unrecorded {
            let secret: Option<Secret> = env.host.get(HOST_NAMESPACE, &chunk.name).await.unwrap();
            assert!(secret.is_none());
        }
    }

    #[tokio::test]
    async fn test_teardown_removes_an_unlabeled_export() {
        let env = TestEnv::new();
        let item = env.create_deploy_item("db", alpine()).await;
        env.deployer.reconcile(&item).await.unwrap();
        let export = Secret {
            metadata: ObjectMeta {
                name: Some("team-a-db-export".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        env.host.create(HOST_NAMESPACE, &export).await.unwrap();

        env.request_operation(&item, "force-cleanup").await;
        let item = env.delete_deploy_item(&item).await;
        env.deployer.delete(&item).await.unwrap();

        assert!(env.deploy_item(&item.reference()).await.is_none());
        let secrets: Vec<Secret> = env
            .host
            .list(HOST_NAMESPACE, &Default::default())
            .await
            .unwrap();
        assert!(secrets.is_empty());
    }
}
