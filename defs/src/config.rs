use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DefsError;

/// Deployer configuration, loaded from a YAML file at startup.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// Written as deployer-id label on every host object; scopes garbage collection.
    pub identity: String,
    /// Host namespace pods and their resources are created in.
    pub namespace: String,
    /// Image used when a DeployItem does not define one.
    pub default_image: String,
    pub init_container: ContainerImageSpec,
    pub wait_container: ContainerImageSpec,
    pub oci: OciConfiguration,
    pub garbage_collection: GarbageCollectionConfiguration,
    pub debug: DebugConfiguration,
    /// Execution budget of a DeployItem without its own timeout.
    pub default_timeout: String,
    /// How long to wait for a service account token to be populated.
    pub token_wait_timeout: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            identity: "default".to_string(),
            namespace: "default".to_string(),
            default_image: String::new(),
            init_container: ContainerImageSpec {
                image: "container-deployer-init:latest".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
            },
            wait_container: ContainerImageSpec {
                image: "container-deployer-wait:latest".to_string(),
                image_pull_policy: "IfNotPresent".to_string(),
            },
            oci: OciConfiguration::default(),
            garbage_collection: GarbageCollectionConfiguration::default(),
            debug: DebugConfiguration::default(),
            default_timeout: "10m".to_string(),
            token_wait_timeout: "2m".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageSpec {
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OciConfiguration {
    /// Docker config files used as registry credentials.
    pub config_files: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GarbageCollectionConfiguration {
    pub disable: bool,
    pub interval: String,
    /// Keep finished pods instead of deleting them.
    pub keep_pods: bool,
}

impl Default for GarbageCollectionConfiguration {
    fn default() -> Self {
        GarbageCollectionConfiguration {
            disable: false,
            interval: "1h".to_string(),
            keep_pods: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugConfiguration {
    pub keep_pod: bool,
}

impl Configuration {
    pub fn from_yaml_str(content: &str) -> Result<Self, DefsError> {
        let configuration: Configuration = serde_yaml::from_str(content)?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn from_yaml_file(path: &str) -> Result<Self, DefsError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            DefsError::ReadConfiguration {
                path: path.to_string(),
                source,
            }
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<(), DefsError> {
        if self.identity.is_empty() {
            return Err(DefsError::Invalid("identity must not be empty".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(DefsError::Invalid("namespace must not be empty".to_string()));
        }
        if self.init_container.image.is_empty() || self.wait_container.image.is_empty() {
            return Err(DefsError::Invalid(
                "init and wait container images must be set".to_string(),
            ));
        }
        self.garbage_collection_interval()?;
        self.default_timeout()?;
        self.token_wait_timeout()?;
        Ok(())
    }

    pub fn garbage_collection_interval(&self) -> Result<Duration, DefsError> {
        parse_duration("garbageCollection.interval", &self.garbage_collection.interval)
    }

    pub fn default_timeout(&self) -> Result<Duration, DefsError> {
        parse_duration("defaultTimeout", &self.default_timeout)
    }

    pub fn token_wait_timeout(&self) -> Result<Duration, DefsError> {
        parse_duration("tokenWaitTimeout", &self.token_wait_timeout)
    }
}

pub fn parse_duration(field: &str, value: &str) -> Result<Duration, DefsError> {
    humantime::parse_duration(value)
        .map_err(|e| DefsError::Invalid(format!("{}: '{}' is not a duration: {}", field, value, e)))
}
