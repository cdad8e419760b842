//! Error types for PTY process operations.

use std::io;

use thiserror::Error;

use crate::options::WinSize;
use crate::selector::BackendKind;

/// Errors from spawning and driving a PTY process.
#[derive(Error, Debug)]
pub enum PtyError {
    /// A native call failed while building the process. Nothing acquired
    /// before the failure is left open.
    #[error("{operation} failed: {source}")]
    Setup {
        operation: String,
        #[source]
        source: io::Error,
    },

    /// The selected backend cannot run in this build or has no registration.
    #[error("{0} backend is not available")]
    BackendUnavailable(BackendKind),

    /// A query against a running process failed.
    #[error("{operation} failed: {source}")]
    Query {
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resize console to {size}: {source}")]
    Resize {
        size: WinSize,
        #[source]
        source: io::Error,
    },

    #[error("process is still alive")]
    StillRunning,

    #[error("exit status was already published")]
    ExitAlreadyPublished,

    #[error("command must contain at least one argument")]
    EmptyCommand,

    #[error("invalid window size {cols}x{rows}: both dimensions must be positive")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl PtyError {
    pub(crate) fn setup(operation: impl Into<String>, source: io::Error) -> Self {
        PtyError::Setup {
            operation: operation.into(),
            source,
        }
    }

    /// Wraps an error coming out of `portable-pty`, which reports through
    /// `anyhow`.
    pub(crate) fn setup_any(operation: impl Into<String>, source: anyhow::Error) -> Self {
        PtyError::Setup {
            operation: operation.into(),
            source: io::Error::other(format!("{source:#}")),
        }
    }

    pub(crate) fn query(operation: impl Into<String>, source: io::Error) -> Self {
        PtyError::Query {
            operation: operation.into(),
            source,
        }
    }
}

/// Result type for PTY process operations.
pub type Result<T> = std::result::Result<T, PtyError>;
