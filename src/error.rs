//! Error types for task dispatch operations.
//!
//! Defines the error types for the major subsystems:
//! - Submission and routing (`DispatchError`)
//! - Broker transport (`BrokerError`)
//! - Configuration loading (`ConfigError`)
//!
//! Errors raised while a logical task is in flight never cross task
//! boundaries: the result waiter folds them into a `TaskOutcome`.

use thiserror::Error;

/// Errors surfaced synchronously by the dispatch client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue '{queue}' is not present in the routing table")]
    Routing { queue: String },

    #[error("No route registered for task type '{0}'")]
    UnroutedTaskType(String),

    #[error("Broker rejected submission: {0}")]
    Transport(#[from] BrokerError),

    #[error("Failed to serialize task message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    /// Returns whether this error comes from the routing table rather than
    /// from the broker.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            DispatchError::Routing { .. } | DispatchError::UnroutedTaskType(_)
        )
    }
}

/// Errors reported by a broker implementation.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed broker record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

impl BrokerError {
    /// Returns whether the broker reached a stored record it could not
    /// decode. The record is consumed either way, so asking again is futile.
    pub fn is_malformed_record(&self) -> bool {
        matches!(self, BrokerError::Serialization(_) | BrokerError::Encoding(_))
    }
}

/// Errors that can occur while building a `DispatchConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
