//! WolfGTM Error Types

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Result type alias for WolfGTM operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGTM error types
#[derive(Error, Debug)]
pub enum Error {
    // Registry errors
    #[error("Node already registered and connected: {0}")]
    AlreadyExists(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Disconnect of {0} rejected: connection does not own the registration")]
    ConnectionMismatch(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    // Global xmin errors
    #[error("Node not registered: {0}")]
    NodeNotRegistered(String),

    #[error("Node excluded from global xmin computation: {0}")]
    NodeExcluded(String),

    #[error("Reported xmin {reported} precedes previously reported xmin {previous} for node {node}")]
    XminTooOld {
        node: String,
        reported: u32,
        previous: u32,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Register log errors
    #[error("Register log corrupted at offset {offset}: {reason}")]
    RegisterLogCorrupted { offset: u64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Standby error: {0}")]
    Standby(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Wire error code reported back to the remote node
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::UnknownNode(_) => ErrorCode::UnknownNode,
            Error::ConnectionMismatch(_) => ErrorCode::ConnectionMismatch,
            Error::InvalidRegistration(_) => ErrorCode::InvalidRegistration,
            Error::OutOfMemory(_) => ErrorCode::OutOfMemory,
            Error::NodeNotRegistered(_) => ErrorCode::NodeNotRegistered,
            Error::NodeExcluded(_) => ErrorCode::NodeExcluded,
            Error::XminTooOld { .. } => ErrorCode::TooOldXmin,
            Error::ShuttingDown => ErrorCode::ShuttingDown,
            _ => ErrorCode::Internal,
        }
    }

    /// Check if this error is a communication failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }

    /// Conflict errors leave registry state untouched; the caller is expected
    /// to restart its reporting cycle
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_) | Error::NodeExcluded(_) | Error::XminTooOld { .. }
        )
    }
}
