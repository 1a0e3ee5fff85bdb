use crate::graph::OpType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executor errors.
///
/// Errors are `Clone` so a failure recorded on a stage worker can be re-raised
/// on whichever thread consumes the outputs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Graph construction error: {0}")]
    Construction(String),

    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(String),

    #[error("Error in {stage} operator `{instance_name}` ({schema}): {message}")]
    Operator {
        instance_name: String,
        stage: OpType,
        schema: String,
        message: String,
    },

    #[error("Stop signaled")]
    StopSignaled,

    #[error("Unknown error")]
    Unknown,

    #[error("Queue depth exhausted in {0} stage: release outputs before running another iteration")]
    QueueDepthExhausted(OpType),

    #[error("No outputs ready: run or prefetch the pipeline first")]
    NoOutputsReady,

    #[error("Executor busy: {0}")]
    Busy(String),

    #[error("Executor not built: {0}")]
    NotBuilt(String),

    #[error("Operator not found: {0}")]
    OperatorNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Worker thread error: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn construction<E: std::fmt::Display>(e: E) -> Self {
        Self::Construction(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn checkpoint<E: std::fmt::Display>(e: E) -> Self {
        Self::Checkpoint(e.to_string())
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::StopSignaled)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Construction(_)
            | Self::InvalidBatchSize(_)
            | Self::NotBuilt(_)
            | Self::OperatorNotFound(_)
            | Self::Config(_) => ErrorCategory::Construction,
            Self::StopSignaled => ErrorCategory::Stopped,
            Self::Device(_) | Self::Worker(_) | Self::Internal(_) => ErrorCategory::Infrastructure,
            _ => ErrorCategory::Runtime,
        }
    }
}

impl From<Box<bincode::ErrorKind>> for ExecutorError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<crate::config::ConfigError> for ExecutorError {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Coarse classification used by callers deciding how to react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Bad graph or configuration - fix the input, do not retry
    Construction,
    /// Failure while running an iteration
    Runtime,
    /// Graceful shutdown, not a failure
    Stopped,
    /// Device or worker thread failure
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Construction => "construction",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Stopped => "stopped",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "construction" => Ok(ErrorCategory::Construction),
            "runtime" => Ok(ErrorCategory::Runtime),
            "stopped" => Ok(ErrorCategory::Stopped),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(ExecutorError::config(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
