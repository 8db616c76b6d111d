use std::time::Duration;

use rollout_core::{CorrelationId, ErroredData};

/// Failure reported by an [`Executor`](crate::Executor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The release could not be started at all.
    #[error("failed to launch release: {message}")]
    Launch { message: String, stack: String },

    /// The release started and then failed.
    #[error("release failed: {message}")]
    Run { message: String, stack: String },

    #[error("release timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutorError {
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch {
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn run(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Run {
            message: message.into(),
            stack: stack.into(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Launch { message, .. } | Self::Run { message, .. } => message.clone(),
            Self::Timeout(_) => self.to_string(),
        }
    }

    pub fn stack(&self) -> &str {
        match self {
            Self::Launch { stack, .. } | Self::Run { stack, .. } => stack,
            Self::Timeout(_) => "",
        }
    }

    /// Stable code for logs and crash records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "EXECUTOR_LAUNCH",
            Self::Run { .. } => "EXECUTOR_RUN",
            Self::Timeout(_) => "EXECUTOR_TIMEOUT",
        }
    }

    /// Payload for the `DeploymentErrored` event.
    pub fn to_errored(&self) -> ErroredData {
        ErroredData {
            message: self.message(),
            stack: self.stack().to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Acknowledged under `id`, but the release could not be started.
    #[error("deployment {id} could not start: {source}")]
    Launch {
        id: CorrelationId,
        #[source]
        source: ExecutorError,
    },

    #[error("not accepting deployments: shutting down")]
    ShuttingDown,
}

impl TriggerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownService(_) => "UNKNOWN_SERVICE",
            Self::Launch { .. } => "EXECUTOR_LAUNCH",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}
