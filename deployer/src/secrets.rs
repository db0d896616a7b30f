//! Secrets the deployer writes for an execution pod: configuration, target,
//! narrowed registry pull secrets and the copied export.

use async_trait::async_trait;
use deployer_defs::{
    CONFIGURATION_FILENAME, CONFIGURATION_TYPE, ComponentDescriptorReference, DeployItem,
    EXPORT_TYPE, ObjectReference, ProviderConfiguration, REGISTRY_PULL_SECRET_TYPE, TARGET_FILENAME,
    TARGET_TYPE, Target,
};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use kube::api::ObjectMeta;
use log::{debug, info, warn};
use oci_distribution::Reference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cluster::{ClusterClient, Labels};
use crate::errors::DeployerError;
use crate::names::{
    blueprint_pull_secret_name, component_descriptor_pull_secret_name, configuration_secret_name,
    deploy_item_export_secret_name, export_secret_name, image_pull_secret_name, target_secret_name,
    with_type,
};

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_HUB_HOST: &str = "index.docker.io";
const OCI_REGISTRY_CONTEXT: &str = "ociRegistry";

/// Names of the pull secrets written for a pod.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullSecrets {
    pub image: Option<String>,
    pub blueprint: Option<String>,
    pub component_descriptor: Option<String>,
}

impl PullSecrets {
    /// Secrets read by the init container.
    pub fn init_secret_names(&self) -> Vec<String> {
        self.blueprint
            .iter()
            .chain(self.component_descriptor.iter())
            .cloned()
            .collect()
    }
}

/// Docker config file, as stored in `.dockerconfigjson`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DockerConfigFile {
    #[serde(default)]
    pub auths: BTreeMap<String, AuthConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, rename = "identitytoken", skip_serializing_if = "String::is_empty")]
    pub identity_token: String,
    #[serde(default, rename = "registrytoken", skip_serializing_if = "String::is_empty")]
    pub registry_token: String,
}

/// Resolves where a blueprint resource of a component is stored.
#[async_trait]
pub trait BlueprintResolver: Send + Sync {
    /// OCI reference of the blueprint, `None` if it is a local blob of the
    /// component descriptor and needs no credentials of its own.
    async fn blueprint_reference(
        &self,
        component_descriptor: &ComponentDescriptorReference,
        resource_name: &str,
    ) -> anyhow::Result<Option<String>>;
}

fn normalize_registry(host: &str) -> &str {
    match host {
        "docker.io" | "registry-1.docker.io" => DOCKER_HUB_HOST,
        other => other,
    }
}

/// Registry host and repository of an image reference. Docker Hub is
/// reported as `index.docker.io`.
pub fn parse_image_reference(image: &str) -> Result<(String, String), DeployerError> {
    let reference: Reference = image.parse().map_err(|e| {
        DeployerError::Configuration(format!("invalid image reference {}: {}", image, e))
    })?;
    Ok((
        normalize_registry(reference.registry()).to_string(),
        reference.repository().to_string(),
    ))
}

fn normalize_key(key: &str) -> String {
    let key = key
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let key = key
        .strip_suffix("/v1")
        .or_else(|| key.strip_suffix("/v2"))
        .unwrap_or(key);
    match key.split_once('/') {
        Some((host, path)) => format!("{}/{}", normalize_registry(host), path),
        None => normalize_registry(key).to_string(),
    }
}

/// Registry credentials collected from docker config files and secrets.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    entries: Vec<(String, AuthConfig)>,
}

impl Keyring {
    pub fn add_config(&mut self, config: DockerConfigFile) {
        for (key, auth) in config.auths {
            self.entries.push((normalize_key(&key), auth));
        }
    }

    pub fn add_from_slice(&mut self, data: &[u8]) -> Result<(), serde_json::Error> {
        self.add_config(serde_json::from_slice(data)?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Credentials for the image, matched by the longest registry or
    /// repository prefix. Earlier sources win on equal prefixes.
    pub fn get(&self, image: &str) -> Result<Option<&AuthConfig>, DeployerError> {
        let (registry, repository) = parse_image_reference(image)?;
        let candidate = format!("{}/{}", registry, repository);
        let mut best: Option<(usize, &AuthConfig)> = None;
        for (key, auth) in &self.entries {
            let matches = candidate == *key || candidate.starts_with(&format!("{}/", key));
            if matches && best.is_none_or(|(len, _)| key.len() > len) {
                best = Some((key.len(), auth));
            }
        }
        Ok(best.map(|(_, auth)| auth))
    }
}

async fn add_secret_to_keyring<C: ClusterClient>(
    control: &C,
    keyring: &mut Keyring,
    secret_ref: &ObjectReference,
    default_namespace: &str,
) {
    let namespace = if secret_ref.namespace.is_empty() {
        default_namespace
    } else {
        &secret_ref.namespace
    };
    let secret = match control.get::<Secret>(namespace, &secret_ref.name).await {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            debug!("registry pull secret {}/{} not found", namespace, secret_ref.name);
            return;
        }
        Err(e) => {
            warn!(
                "unable to read registry pull secret {}/{}: {}",
                namespace, secret_ref.name, e
            );
            return;
        }
    };
    let Some(data) = secret.data.as_ref().and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY)) else {
        debug!("secret {}/{} has no docker config", namespace, secret_ref.name);
        return;
    };
    if let Err(e) = keyring.add_from_slice(&data.0) {
        debug!(
            "secret {}/{} holds an invalid docker config: {}",
            namespace, secret_ref.name, e
        );
    }
}

/// Builds the keyring from the configured docker config files, the
/// provider configuration's secrets and the DeployItem's secrets, in that
/// order. Unreadable sources are skipped.
pub async fn build_keyring<C: ClusterClient>(
    control: &C,
    config_files: &[String],
    deploy_item: &DeployItem,
    provider: &ProviderConfiguration,
) -> Keyring {
    let mut keyring = Keyring::default();
    for path in config_files {
        match tokio::fs::read(path).await {
            Ok(data) => {
                if let Err(e) = keyring.add_from_slice(&data) {
                    warn!("invalid docker config file {}: {}", path, e);
                }
            }
            Err(e) => warn!("unable to read docker config file {}: {}", path, e),
        }
    }
    let namespace = deploy_item.reference().namespace;
    let secret_refs = provider
        .registry_pull_secrets
        .iter()
        .chain(deploy_item.spec.registry_pull_secrets.iter());
    for secret_ref in secret_refs {
        add_secret_to_keyring(control, &mut keyring, secret_ref, &namespace).await;
    }
    keyring
}

/// Writes a pull secret holding only the credentials for `image`. Returns
/// `None` if the keyring has no credentials for it.
pub async fn sync_pull_secret<C: ClusterClient>(
    host: &C,
    namespace: &str,
    name: &str,
    image: &str,
    keyring: &Keyring,
    labels: &Labels,
) -> Result<Option<String>, DeployerError> {
    let (registry, _) = parse_image_reference(image)?;
    let Some(auth) = keyring.get(image)? else {
        debug!("no registry credentials for {}", image);
        return Ok(None);
    };
    let config = DockerConfigFile {
        auths: BTreeMap::from([(registry, auth.clone())]),
    };
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_type(labels.clone(), REGISTRY_PULL_SECRET_TYPE)),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(serde_json::to_vec(&config)?),
        )])),
        ..Default::default()
    };
    host.apply(namespace, &secret).await?;
    Ok(Some(name.to_string()))
}

/// Writes the pull secrets of the main image, the component descriptor
/// and the blueprint.
pub async fn sync_pull_secrets<C: ClusterClient>(
    host: &C,
    item: &ObjectReference,
    namespace: &str,
    labels: &Labels,
    provider: &ProviderConfiguration,
    keyring: &Keyring,
    resolver: Option<&dyn BlueprintResolver>,
) -> Result<PullSecrets, DeployerError> {
    let mut secrets = PullSecrets {
        image: sync_pull_secret(
            host,
            namespace,
            &image_pull_secret_name(&item.namespace, &item.name),
            &provider.image,
            keyring,
            labels,
        )
        .await?,
        ..Default::default()
    };

    let Some(cd) = &provider.component_descriptor else {
        return Ok(secrets);
    };
    if cd.repository_context.type_ != OCI_REGISTRY_CONTEXT {
        return Err(DeployerError::Configuration(format!(
            "unsupported repository context type {}",
            cd.repository_context.type_
        )));
    }
    secrets.component_descriptor = sync_pull_secret(
        host,
        namespace,
        &component_descriptor_pull_secret_name(&item.namespace, &item.name),
        &cd.oci_reference(),
        keyring,
        labels,
    )
    .await?;

    let Some(blueprint) = &provider.blueprint else {
        return Ok(secrets);
    };
    let Some(resolver) = resolver else {
        debug!("no blueprint resolver configured, skipping blueprint pull secret");
        return Ok(secrets);
    };
    if let Some(reference) = resolver
        .blueprint_reference(cd, &blueprint.resource_name)
        .await?
    {
        secrets.blueprint = sync_pull_secret(
            host,
            namespace,
            &blueprint_pull_secret_name(&item.namespace, &item.name),
            &reference,
            keyring,
            labels,
        )
        .await?;
    }
    Ok(secrets)
}

/// Writes the DeployItem configuration for the init container.
pub async fn sync_configuration<C: ClusterClient>(
    host: &C,
    item: &ObjectReference,
    namespace: &str,
    labels: &Labels,
    configuration: &serde_json::Value,
) -> Result<String, DeployerError> {
    let name = configuration_secret_name(&item.namespace, &item.name);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_type(labels.clone(), CONFIGURATION_TYPE)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIGURATION_FILENAME.to_string(),
            ByteString(serde_json::to_vec(configuration)?),
        )])),
        ..Default::default()
    };
    host.apply(namespace, &secret).await?;
    Ok(name)
}

/// Copies the referenced Target into the host cluster. A missing Target
/// is retried by the caller.
pub async fn sync_target<C: ClusterClient>(
    control: &C,
    host: &C,
    item: &ObjectReference,
    namespace: &str,
    labels: &Labels,
    target: Option<&ObjectReference>,
) -> Result<Option<String>, DeployerError> {
    let Some(target_ref) = target else {
        return Ok(None);
    };
    let target_namespace = if target_ref.namespace.is_empty() {
        &item.namespace
    } else {
        &target_ref.namespace
    };
    let target: Target = control
        .get(target_namespace, &target_ref.name)
        .await?
        .ok_or_else(|| DeployerError::NotFound {
            kind: "Target".to_string(),
            name: format!("{}/{}", target_namespace, target_ref.name),
        })?;
    let content = serde_json::json!({
        "name": target_ref.name,
        "namespace": target_namespace,
        "type": target.spec.type_,
        "config": target.spec.config,
    });

    let name = target_secret_name(&item.namespace, &item.name);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(with_type(labels.clone(), TARGET_TYPE)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            TARGET_FILENAME.to_string(),
            ByteString(serde_json::to_vec(&content)?),
        )])),
        ..Default::default()
    };
    host.apply(namespace, &secret).await?;
    Ok(Some(name))
}

/// Copies the export written by the wait container into the DeployItem's
/// namespace, owned by the DeployItem. A missing export is not an error.
pub async fn sync_export<C: ClusterClient>(
    control: &C,
    host: &C,
    deploy_item: &DeployItem,
    namespace: &str,
) -> Result<Option<ObjectReference>, DeployerError> {
    let item = deploy_item.reference();
    let source_name = export_secret_name(&item.namespace, &item.name);
    let Some(source) = host.get::<Secret>(namespace, &source_name).await? else {
        info!("no export found for deploy item {}", item);
        return Ok(None);
    };

    let name = deploy_item_export_secret_name(&item.name);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(item.namespace.clone()),
            labels: Some(Labels::from([(
                deployer_defs::TYPE_LABEL.to_string(),
                EXPORT_TYPE.to_string(),
            )])),
            owner_references: deploy_item.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        data: source.data.clone(),
        ..Default::default()
    };
    control.apply(&item.namespace, &secret).await?;
    debug!("synced export of deploy item {} to {}", item, name);
    Ok(Some(ObjectReference::new(&name, &item.namespace)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use deployer_defs::{BlueprintReference, DeployItemSpec, RepositoryContext};
    use pretty_assertions::assert_eq;

    fn auth(user: &str) -> AuthConfig {
        AuthConfig {
            username: user.to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    fn keyring(entries: &[(&str, &str)]) -> Keyring {
        let mut keyring = Keyring::default();
        keyring.add_config(DockerConfigFile {
            auths: entries
                .iter()
                .map(|(k, u)| (k.to_string(), auth(u)))
                .collect(),
        });
        keyring
    }

    struct StaticResolver(Option<String>);

    #[async_trait]
    impl BlueprintResolver for StaticResolver {
        async fn blueprint_reference(
            &self,
            _component_descriptor: &ComponentDescriptorReference,
            _resource_name: &str,
        ) -> anyhow::Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_docker_hub_aliases() {
        assert_eq!(
            parse_image_reference("ubuntu:22.04").unwrap(),
            ("index.docker.io".to_string(), "library/ubuntu".to_string())
        );
        let keyring = keyring(&[("https://index.docker.io/v1/", "hub")]);
        assert_eq!(keyring.get("docker.io/library/ubuntu:22.04").unwrap().unwrap().username, "hub");
        assert!(parse_image_reference("").is_err());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let keyring = keyring(&[
            ("registry.example.com", "registry"),
            ("registry.example.com/team-a", "team"),
        ]);
        let team = keyring.get("registry.example.com/team-a/app:1.0").unwrap();
        assert_eq!(team.unwrap().username, "team");
        let other = keyring.get("registry.example.com/team-b/app:1.0").unwrap();
        assert_eq!(other.unwrap().username, "registry");
        // a prefix must end at a path boundary
        assert!(keyring.get("registry.example.community/app:1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_secret_holds_single_entry() {
        let host = MemoryCluster::new();
        let keyring = keyring(&[
            ("registry.example.com", "registry"),
            ("other.example.com", "other"),
        ]);
        let name = sync_pull_secret(
            &host,
            "host",
            "team-a-db-imgpullsec",
            "registry.example.com/app:1.0",
            &keyring,
            &Labels::new(),
        )
        .await
        .unwrap();
        assert_eq!(name.as_deref(), Some("team-a-db-imgpullsec"));

        let secret: Secret = host.get("host", "team-a-db-imgpullsec").await.unwrap().unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        let data = secret.data.unwrap();
        let config: DockerConfigFile =
            serde_json::from_slice(&data[DOCKER_CONFIG_JSON_KEY].0).unwrap();
        assert_eq!(config.auths.len(), 1);
        assert_eq!(config.auths["registry.example.com"].username, "registry");

        let none = sync_pull_secret(&host, "host", "x", "quay.io/app:1", &keyring, &Labels::new())
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_sync_pull_secrets_with_component_descriptor_and_blueprint() {
        let host = MemoryCluster::new();
        let keyring = keyring(&[("registry.example.com", "registry")]);
        let item = ObjectReference::new("db", "team-a");
        let provider = ProviderConfiguration {
            image: "alpine:3.20".to_string(),
            component_descriptor: Some(ComponentDescriptorReference {
                repository_context: RepositoryContext {
                    type_: "ociRegistry".to_string(),
                    base_url: "registry.example.com/components".to_string(),
                },
                component_name: "example.com/app".to_string(),
                version: "v1.0.0".to_string(),
            }),
            blueprint: Some(BlueprintReference {
                resource_name: "blueprint".to_string(),
            }),
            ..Default::default()
        };

        let resolver = StaticResolver(Some("registry.example.com/blueprints/app:v1".to_string()));
        let secrets = sync_pull_secrets(
            &host,
            &item,
            "host",
            &Labels::new(),
            &provider,
            &keyring,
            Some(&resolver),
        )
        .await
        .unwrap();
        assert_eq!(secrets.image, None);
        assert_eq!(
            secrets.component_descriptor.as_deref(),
            Some("team-a-db-cdpullsec")
        );
        assert_eq!(secrets.blueprint.as_deref(), Some("team-a-db-bppullsec"));
        assert_eq!(secrets.init_secret_names().len(), 2);

        // blueprints stored as local blobs need no secret
        let local = StaticResolver(None);
        let secrets = sync_pull_secrets(
            &host,
            &item,
            "host",
            &Labels::new(),
            &provider,
            &keyring,
            Some(&local),
        )
        .await
        .unwrap();
        assert_eq!(secrets.blueprint, None);
    }

    #[tokio::test]
    async fn test_build_keyring_skips_invalid_sources() {
        let control = MemoryCluster::new();
        let valid = Secret {
            metadata: ObjectMeta {
                name: Some("creds".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_JSON_KEY.to_string(),
                ByteString(br#"{"auths": {"quay.io": {"username": "q"}}}"#.to_vec()),
            )])),
            ..Default::default()
        };
        let invalid = Secret {
            metadata: ObjectMeta {
                name: Some("broken".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_JSON_KEY.to_string(),
                ByteString(b"not json".to_vec()),
            )])),
            ..Default::default()
        };
        control.create("team-a", &valid).await.unwrap();
        control.create("team-a", &invalid).await.unwrap();

        let mut item = DeployItem::new("db", DeployItemSpec::default());
        item.metadata.namespace = Some("team-a".to_string());
        item.spec.registry_pull_secrets = vec![
            ObjectReference::new("broken", ""),
            ObjectReference::new("missing", ""),
            ObjectReference::new("creds", ""),
        ];
        let keyring = build_keyring(
            &control,
            &["/does/not/exist.json".to_string()],
            &item,
            &ProviderConfiguration::default(),
        )
        .await;
        assert_eq!(keyring.get("quay.io/app:1").unwrap().unwrap().username, "q");
    }
}
