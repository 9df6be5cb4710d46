//! Error types for laundromat
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Store, Download, Config)
//! - A `Result` alias used throughout the crate
//! - Conversions from the I/O, HTTP, database, and serialization layers

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for laundromat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for laundromat
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "subscribe")
        key: Option<String>,
    },

    /// State-store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// SQLx database error
    #[error("store error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Invalid schedule expression
    #[error("invalid schedule: {0}")]
    Schedule(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (media extraction tool)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific option key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// State-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backing store
    #[error("failed to connect to store: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored document could not be mapped to an item
    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The download target is not a valid URL
    #[error("invalid download url: {url}")]
    InvalidUrl {
        /// The offending target
        url: String,
    },

    /// No external extraction tool is available for a tool-mediated fetch
    #[error("media tool not found for {url}")]
    ToolMissing {
        /// The target that required the tool
        url: String,
    },

    /// The fetch completed but produced no usable files
    #[error("no media produced for {url} in {dir}")]
    NoMediaProduced {
        /// The target that was fetched
        url: String,
        /// The temp directory that was scanned
        dir: PathBuf,
    },

    /// The fetch failed after exhausting its retry budget
    #[error("download failed for {url}: {reason}")]
    Failed {
        /// The target that was fetched
        url: String,
        /// The final failure
        reason: String,
    },
}
