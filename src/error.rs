//! Error types for the dispatcher.

use std::time::Duration;

/// Top-level error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the key/value + stream broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker command {command} failed: {reason}")]
    Command { command: String, reason: String },
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            BrokerError::Connection(e.to_string())
        } else {
            BrokerError::Command {
                command: e.code().unwrap_or("redis").to_string(),
                reason: e.to_string(),
            }
        }
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Publish to {stream} failed: {source}")]
    Publish {
        stream: String,
        #[source]
        source: BrokerError,
    },

    #[error("Job {job_id} already sent its final message")]
    Finished { job_id: String },

    #[error("Cleanup of job {job_id} failed: {source}")]
    Cleanup {
        job_id: String,
        #[source]
        source: BrokerError,
    },
}

/// Conversation state store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Broker error on {key}: {source}")]
    Broker {
        key: String,
        #[source]
        source: BrokerError,
    },

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Worker spawn errors.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Spawner backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Worker image not configured")]
    MissingImage,

    #[error("Failed to create worker for job {job_id}: {reason}")]
    CreateFailed { job_id: String, reason: String },

    #[error("Failed to start worker for job {job_id}: {reason}")]
    StartFailed { job_id: String, reason: String },

    #[error("Invalid resource quantity {value}: {reason}")]
    InvalidResource { value: String, reason: String },
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("No channel registered for platform {0}")]
    UnknownPlatform(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Ticket source errors.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("Ticket source {project} request failed: {reason}")]
    RequestFailed { project: String, reason: String },

    #[error("Ticket source {project} returned {status}")]
    BadStatus { project: String, status: u16 },

    #[error("Unknown project {0}")]
    UnknownProject(String),
}

/// Result type alias for the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;
