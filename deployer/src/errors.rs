use deployer_defs::{DefsError, LastError};
use deployer_utils::get_timestamp;
use std::time::Duration;
use thiserror::Error;

/// Error codes recorded in `LastError.codes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    ConfigurationProblem,
    ImagePull,
    Timeout,
    StateTransfer,
    InternalProblem,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigurationProblem => "ERR_CONFIGURATION_PROBLEM",
            ErrorCode::ImagePull => "ERR_IMAGE_PULL",
            ErrorCode::Timeout => "ERR_TIMEOUT",
            ErrorCode::StateTransfer => "ERR_STATE_TRANSFER",
            ErrorCode::InternalProblem => "ERR_INTERNAL_PROBLEM",
        }
    }
}

#[derive(Error, Debug)]
pub enum DeployerError {
    #[error("configuration problem: {0}")]
    Configuration(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("container {container} cannot pull its image ({reason}): {message}")]
    ImagePull {
        container: String,
        reason: String,
        message: String,
    },

    #[error("execution exceeded its timeout of {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("service account token secret {0} was not populated in time")]
    TokenNotReady(String),

    #[error("state transfer failed: {0}")]
    StateTransfer(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error("{operation}/{step}: {source}")]
    Operation {
        operation: String,
        step: String,
        #[source]
        source: Box<DeployerError>,
    },
}

impl From<DefsError> for DeployerError {
    fn from(e: DefsError) -> Self {
        DeployerError::Configuration(e.to_string())
    }
}

impl DeployerError {
    /// Annotates the error with the operation and step it occurred in.
    pub fn wrap(self, operation: &str, step: &str) -> Self {
        DeployerError::Operation {
            operation: operation.to_string(),
            step: step.to_string(),
            source: Box::new(self),
        }
    }

    /// The innermost error, without operation annotations.
    pub fn root(&self) -> &DeployerError {
        match self {
            DeployerError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        match self.root() {
            DeployerError::Configuration(_) => vec![ErrorCode::ConfigurationProblem],
            DeployerError::ImagePull { .. } => {
                vec![ErrorCode::ConfigurationProblem, ErrorCode::ImagePull]
            }
            DeployerError::Timeout { .. } => vec![ErrorCode::Timeout],
            DeployerError::StateTransfer(_) | DeployerError::Io(_) => {
                vec![ErrorCode::StateTransfer]
            }
            _ => vec![ErrorCode::InternalProblem],
        }
    }

    /// Fatal errors fail the DeployItem instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            DeployerError::Configuration(_)
                | DeployerError::ImagePull { .. }
                | DeployerError::Timeout { .. }
        )
    }

    pub fn to_last_error(&self) -> LastError {
        let (operation, reason) = match self {
            DeployerError::Operation {
                operation, step, ..
            } => (operation.clone(), step.clone()),
            _ => ("Reconcile".to_string(), "Unknown".to_string()),
        };
        LastError {
            operation,
            reason,
            message: self.to_string(),
            codes: self.codes().iter().map(|c| c.as_str().to_string()).collect(),
            last_update_time: get_timestamp(),
        }
    }
}

pub trait ResultExt<T> {
    fn wrap_err(self, operation: &str, step: &str) -> Result<T, DeployerError>;
}

impl<T, E: Into<DeployerError>> ResultExt<T> for Result<T, E> {
    fn wrap_err(self, operation: &str, step: &str) -> Result<T, DeployerError> {
        self.map_err(|e| e.into().wrap(operation, step))
    }
}
