use std::time::Duration;

use crate::services::runner::{ExecError, ExitError};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Setting \"{0}\" is not defined.")]
    ConfigMissing(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{reason}")]
    ExternalCommandFailed {
        reason: String,
        #[source]
        source: ExitError,
    },

    #[error("\"{command}\" ran for more than {timeout:?}.")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("\"juju status\" returned invalid data: {raw}")]
    StatusDecode {
        raw: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("App \"{app}\" does not have a unit named \"{unit}\".")]
    UnknownUnit { app: String, unit: String },

    #[error("Cannot add zero units.")]
    ZeroUnits,

    #[error("App \"{0}\" has no units.")]
    NoUnits(String),

    #[error("load balancer for app \"{0}\" not found")]
    ResourceNotFound(String),

    #[error("unit store operation failed: {0}")]
    Store(String),

    #[error("queue operation failed: {0}")]
    Queue(String),

    #[error("no message available in queue \"{0}\"")]
    QueueTimeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<ExecError> for ProvisionError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout { command, timeout } => ProvisionError::Timeout { command, timeout },
            ExecError::Failed { output, source } => ProvisionError::ExternalCommandFailed {
                reason: output.trim_end().to_string(),
                source,
            },
            ExecError::Spawn { program, source } => ProvisionError::Spawn { program, source },
        }
    }
}

impl ProvisionError {
    /// Captured tool output for a failed invocation, if this error carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ProvisionError::ExternalCommandFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
