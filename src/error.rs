//! Error types for the job queue.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Admission failure. Callers should back off and retry.
    #[error("Queue is full ({max} jobs queued or running)")]
    QueueFull { max: usize },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job input: {0}")]
    InvalidInput(String),
}

/// Errors from resolving, loading or running a computation graph.
///
/// Display strings deliberately carry no filesystem paths.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Graph location is outside the allowed directory")]
    PathRejected,

    #[error("Graph file extension is not allowed")]
    ExtensionNotAllowed,

    #[error("Failed to read graph manifest: {0}")]
    Read(#[from] std::io::Error),

    #[error("Invalid graph manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("No graph registered for kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("Failed to build graph '{kind}': {reason}")]
    Build { kind: String, reason: String },

    #[error("{0}")]
    Execution(String),
}

/// Worker pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Job manager availability stream is already attached to a pool")]
    AlreadyAttached,
}
