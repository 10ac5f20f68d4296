//! Unified error types for the tether workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that wraps
//! these common variants when appropriate.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum TetherError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path or device where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An OS facility could not be set up or used.
    #[error("{facility} failed: {source}")]
    Os {
        /// Facility that failed (for example `signal registration`).
        facility: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The operation is not available on this platform.
    #[error("{operation} is not supported on {os}")]
    Unsupported {
        /// Operation that was attempted.
        operation: &'static str,
        /// Host operating system name.
        os: &'static str,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl TetherError {
    /// Builds an [`TetherError::Unsupported`] for the current host OS.
    #[must_use]
    pub const fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported {
            operation,
            os: std::env::consts::OS,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TetherError>;
