//! Error types for the agent
//!
//! Each collaborator seam has its own error enum; `AgentError` wraps them so
//! the engines can propagate with `?` up to their per-iteration handler.

use thiserror::Error;

/// Errors raised by the hypervisor connection
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The hypervisor tool ran but reported failure
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Destroy was requested for a domain that is not running
    #[error("domain {0} is not running")]
    NotRunning(String),

    /// A domain descriptor could not be interpreted
    #[error("invalid domain descriptor: {0}")]
    Descriptor(String),

    #[error("hypervisor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building a guest's on-disk artifacts
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("guest has no system disk")]
    NoSystemDisk,

    #[error("failed to render guest config: {0}")]
    Render(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("provisioning I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the volume store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path escapes the volume root (absolute or contains `..`)
    #[error("invalid volume path {0:?}")]
    InvalidPath(String),

    #[error("volume I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the work queue or the instruction channel
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The subscription stream ended
    #[error("instruction channel closed")]
    Closed,
}

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level agent error
#[derive(Debug, Error)]
pub enum AgentError {
    /// The initial hypervisor session could not be opened
    #[error("failed to open hypervisor connection: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to read load average: {0}")]
    Load(std::io::Error),

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
