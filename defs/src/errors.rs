use thiserror::Error;

#[derive(Error, Debug)]
pub enum DefsError {
    #[error("failed to read configuration file {path}: {source}")]
    ReadConfiguration {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ParseConfiguration(#[from] serde_yaml::Error),

    #[error("failed to decode provider configuration: {0}")]
    DecodeProviderConfiguration(String),

    #[error("failed to decode provider status: {0}")]
    DecodeProviderStatus(#[source] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
