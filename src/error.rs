//! Error handling for the mad monitoring daemon
//!
//! This module provides error types for all daemon operations, including
//! the time-series store, configuration loading, command execution, and
//! the HTTP surface.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for the daemon
#[derive(Error, Debug)]
pub enum MadError {
    /// Time-series store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Command execution errors
    #[error("Command execution failed: {cmd}: {source}")]
    CommandFailed {
        cmd: String,
        #[source]
        source: io::Error,
    },

    /// Chart rendering errors
    #[error("Chart rendering failed: {reason}")]
    ChartRender { reason: String },

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(#[from] hyper::Error),

    /// Metrics errors
    #[error("Metrics error: {reason}")]
    Metrics { reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Errors from the multi-resolution time-series store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Level path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("Failed to open segment {path}: {source}")]
    SegmentOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to append to segment {path}: {reason}")]
    SegmentWriteFailed { path: PathBuf, reason: String },

    #[error("Failed to enumerate level directory {path}: {source}")]
    LevelScanFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read segment {path}: {source}")]
    SegmentReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove table directory {path}: {source}")]
    TableRemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid level parameters: {reason}")]
    InvalidLevelParams { reason: String },

    #[error("No time series levels specified")]
    NoLevels,

    #[error("No such level: {index}")]
    NoSuchLevel { index: usize },
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },

    #[error("Unknown handler type: {value}")]
    UnknownHandlerType { value: String },

    #[error("Invalid regex for property {property}: {reason}")]
    InvalidRegex { property: String, reason: String },

    #[error("Regex for property {property} must have exactly one capture group")]
    RegexGroupCount { property: String },

    #[error("Invalid duration: {value}")]
    InvalidDuration { value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, MadError>;

/// A specialized result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl MadError {
    /// Check if this error should take the daemon down.
    ///
    /// Persistent write failure on local disk is unrecoverable for a
    /// local-storage daemon; parse and command failures degrade to a
    /// missing sample instead.
    pub fn is_fatal(&self) -> bool {
        match self {
            MadError::Store(_) => true,
            MadError::Config(_) => true,
            MadError::CommandFailed { .. } => false,
            MadError::ChartRender { .. } => false,
            MadError::Http(_) => false,
            MadError::Metrics { .. } => false,
            MadError::Io(_) => true,
            MadError::Generic(_) => false,
        }
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            MadError::Store(_) => "store",
            MadError::Config(_) => "config",
            MadError::CommandFailed { .. } => "command",
            MadError::ChartRender { .. } => "chart",
            MadError::Http(_) => "http",
            MadError::Metrics { .. } => "metrics",
            MadError::Io(_) => "io",
            MadError::Generic(_) => "generic",
        }
    }
}

impl From<String> for MadError {
    fn from(msg: String) -> Self {
        MadError::Generic(msg)
    }
}

impl From<&str> for MadError {
    fn from(msg: &str) -> Self {
        MadError::Generic(msg.to_string())
    }
}
