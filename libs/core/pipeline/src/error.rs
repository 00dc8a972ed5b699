//! Error types and error categorization
//!
//! Processing failures are categorized to determine retry behavior:
//! - **Transient**: Temporary failures, eligible for the task's retry policy
//! - **Permanent**: Unrecoverable for this input, surfaced immediately

use std::any::Any;
use thiserror::Error;

/// Category of a processing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Temporary failure - retried while the retry policy allows it
    Transient,
    /// Unrecoverable error - never retried
    Permanent,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Failure produced while executing a task or processing a message.
///
/// Cloneable so the same failure can be handed to an exception handler,
/// logged and emitted downstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The processing function failed
    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    /// The input was already a failure when it reached the task
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Circuit breaker rejected the call without invoking the processing function
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    /// The dedicated thread pool rejected or lost the work
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// The processing function panicked
    #[error("Processing function panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Create an upstream error, used for inputs that arrive pre-failed
    pub fn upstream(message: impl Into<String>) -> Self {
        TaskError::Upstream(message.into())
    }

    /// Get the error category.
    ///
    /// Only processing failures can be transient. Everything else describes a
    /// condition a retry inside the same invocation cannot fix.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskError::Processing { category, .. } => *category,
            _ => ErrorCategory::Permanent,
        }
    }

    /// Check if this error should be retried
    pub fn should_retry(&self) -> bool {
        self.category().is_retryable()
    }

    /// Value of the `reason` metrics tag for this error
    pub fn reason(&self) -> &'static str {
        match self {
            TaskError::Processing {
                category: ErrorCategory::Transient,
                ..
            } => "transient_error",
            TaskError::Processing {
                category: ErrorCategory::Permanent,
                ..
            } => "permanent_error",
            TaskError::Upstream(_) => "upstream_error",
            TaskError::CircuitOpen(_) => "circuit_open",
            TaskError::ThreadPool(_) => "thread_pool_error",
            TaskError::Panicked(_) => "panicked",
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        TaskError::Panicked(panic_message(payload.as_ref()))
    }
}

/// Acknowledgment handle failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Acknowledgment failed: {0}")]
pub struct AckError(pub String);

impl AckError {
    pub fn new(message: impl Into<String>) -> Self {
        AckError(message.into())
    }
}

/// Failure of a polling subscriber's pull
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Pull failed: {0}")]
pub struct PullError(pub String);

impl PullError {
    pub fn new(message: impl Into<String>) -> Self {
        PullError(message.into())
    }
}

/// Errors raised while building pipeline components
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_config::ConfigError),

    #[error("Failed to build thread pool '{name}': {source}")]
    ThreadPoolBuild {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn blank_name(what: &str) -> Self {
        PipelineError::InvalidArgument(format!("{what} name must not be blank"))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
