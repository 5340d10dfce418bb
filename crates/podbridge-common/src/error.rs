//! Unified error types for the podbridge workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that wraps
//! these common variants when appropriate.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PodbridgeError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An external command could not be spawned or exited unsuccessfully.
    #[error("`{program} {args}` failed: {message}")]
    Command {
        /// Program that was executed.
        program: String,
        /// Space-joined arguments, for diagnostics.
        args: String,
        /// Captured standard error or spawn failure description.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A lock could not be acquired before its deadline.
    #[error("timed out after {waited_ms} ms waiting for lock {path}")]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
        /// Time spent waiting, in milliseconds.
        waited_ms: u128,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl PodbridgeError {
    /// Builds an [`PodbridgeError::Io`] from a path and an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PodbridgeError>;
