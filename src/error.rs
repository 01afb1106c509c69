//! Error handling for the mining supervisor
//!
//! Error types covering configuration validation, worker lifecycle control
//! and host metrics, with enough context for the HTTP layer to map them to
//! responses.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// A single offending field in a submitted mining configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Field name as it appears in the request body
    pub field: String,
    /// Human-readable explanation
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violated field of one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|e| e.field.as_str())
    }

    /// Check whether a given field was rejected
    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Main error type for the mining supervisor
#[derive(Error, Debug)]
pub enum Error {
    /// Submitted mining configuration is invalid (client-correctable)
    #[error("Invalid mining configuration: {0}")]
    Validation(ValidationErrors),

    /// A worker is already active
    #[error("Worker already running: {message}")]
    Conflict { message: String },

    /// The worker process could not be launched or died immediately
    #[error("Failed to spawn worker: {message}")]
    Spawn { message: String },

    /// The worker exited after it was running
    #[error("Worker failed at runtime: {message}")]
    Runtime { message: String },

    /// A host metric could not be read
    #[error("Metrics unavailable: {metric}")]
    MetricsUnavailable { metric: String },

    /// Server configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The supervisor actor is gone
    #[error("Supervisor channel closed: {message}")]
    ChannelClosed { message: String },
}

impl Error {
    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
        }
    }

    /// Create a runtime failure
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create a metrics error
    pub fn metrics_unavailable(metric: impl Into<String>) -> Self {
        Self::MetricsUnavailable {
            metric: metric.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a channel error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Whether the caller can fix the request and try again
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Conflict { .. })
    }

    /// Get error category for logging and API bodies
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Conflict { .. } => "conflict",
            Error::Spawn { .. } => "spawn",
            Error::Runtime { .. } => "runtime",
            Error::MetricsUnavailable { .. } => "metrics_unavailable",
            Error::Config { .. } => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Timeout { .. } => "timeout",
            Error::ChannelClosed { .. } => "channel_closed",
        }
    }
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}
