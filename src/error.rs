//! Error types for podcast-dl
//!
//! This module provides the error taxonomy of the queue controller:
//! - Persistence errors (unreadable or corrupt queue file, failed writes)
//! - Command errors, local to a single `dispatch` call (not found, duplicate,
//!   invalid transition)
//! - Transfer errors, recorded per item as `last_error`
//! - Machine-readable error codes for front ends

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{QueueItemId, Status};

/// Result type alias for podcast-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for podcast-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_downloads")
        key: Option<String>,
    },

    /// Queue file could not be read, parsed or written
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Another item already targets the destination path
    #[error("duplicate download: {} is already queued", path.display())]
    Duplicate {
        /// The contested destination path
        path: PathBuf,
    },

    /// The enclosure URL cannot be fetched
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// No item with this id exists in the queue
    #[error("queue item {0} not found")]
    NotFound(QueueItemId),

    /// Command is not valid for the item's current state
    #[error("cannot {operation} item {id} in state {current_state}")]
    InvalidTransition {
        /// The item the command targeted
        id: QueueItemId,
        /// The attempted operation (e.g., "pause", "retry")
        operation: &'static str,
        /// The state that rejects the operation
        current_state: Status,
    },

    /// A single transfer failed
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Shutdown in progress - not accepting commands
    #[error("shutdown in progress: not accepting commands")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Queue file persistence errors
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The queue file exists but could not be read
    #[error("failed to read queue file {}: {source}", path.display())]
    Read {
        /// Path of the queue file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The queue file is not a valid queue document
    #[error("queue file {} is corrupt: {reason}", path.display())]
    Corrupt {
        /// Path of the queue file
        path: PathBuf,
        /// What was wrong with the contents
        reason: String,
    },

    /// The queue file was written by an incompatible version
    #[error("queue file {} has unsupported format version {version}", path.display())]
    UnsupportedVersion {
        /// Path of the queue file
        path: PathBuf,
        /// The version found in the file
        version: u32,
    },

    /// Writing or replacing the queue file failed
    #[error("failed to write queue file {}: {source}", path.display())]
    Write {
        /// Path of the queue file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a single enclosure transfer
#[derive(Debug, Error)]
pub enum TransferError {
    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Connection, TLS or body read failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Socket or destination file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No data arrived within the stall timeout
    #[error("transfer stalled: no data for {secs}s")]
    Stalled {
        /// Configured stall timeout in seconds
        secs: u64,
    },

    /// The server response could not be used
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The transfer was cancelled by the scheduler
    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    /// Machine-readable error code, stable across releases
    ///
    /// Front ends use this to decide how to present an error without matching
    /// on message text.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Persistence(_) => "persistence_error",
            Error::Duplicate { .. } => "duplicate",
            Error::InvalidUrl { .. } => "invalid_url",
            Error::NotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Transfer(_) => "transfer_failed",
            Error::ShuttingDown => "shutting_down",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether the error is local to one command and leaves the queue untouched
    pub fn is_command_error(&self) -> bool {
        matches!(
            self,
            Error::Duplicate { .. }
                | Error::InvalidUrl { .. }
                | Error::NotFound(_)
                | Error::InvalidTransition { .. }
        )
    }
}
