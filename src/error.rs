//! Error types for a3s-watch

use thiserror::Error;

/// Errors that can occur in the detection engine and event pipeline
#[derive(Debug, Error)]
pub enum WatchError {
    /// A data source with the same namespace and id is already registered
    #[error("Data source '{id}' already exists in namespace '{namespace}'")]
    DuplicateDataSource { namespace: String, id: String },

    /// The same signature instance was loaded twice
    #[error("Signature '{0}' already loaded")]
    AlreadyLoaded(String),

    /// Signature metadata could not be retrieved
    #[error("Failed to get signature metadata: {0}")]
    Metadata(String),

    /// Signature selected events could not be retrieved
    #[error("Failed to get selected events for signature '{signature}': {reason}")]
    Selector { signature: String, reason: String },

    /// Signature initialization failed
    #[error("Failed to initialize signature '{signature}': {reason}")]
    Init { signature: String, reason: String },

    /// Registration attempted after the handler table was handed off
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Data source lookup found nothing for the key
    #[error("Requested data was not found")]
    DataNotFound,

    /// Data source does not support the queried key kind
    #[error("Queried key is not supported")]
    KeyNotSupported,

    /// Engine built without one of its required channels
    #[error("Missing {0} channel")]
    MissingChannel(&'static str),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Runtime failure inside a signature callback
    #[error("Signature error: {0}")]
    Signature(String),

    /// Container metadata could not be resolved
    #[error("Enrichment error: {0}")]
    Enrichment(String),

    /// Process attribute could not be read
    #[error("Process inspection failed for pid {pid}: {reason}")]
    ProcessInspection { pid: u32, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// Result type alias for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
