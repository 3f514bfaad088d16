//! Error catalog and shared error types.
//!
//! Per-module error enums (`StubError`, `DigestError`, ...) live next to the
//! code that raises them. This module holds the user-facing catalog and the
//! top-level `ActionError` used by the orchestrator.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop a remote action before any command runs.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("working dir {working_dir} is not under exec_root {exec_root}")]
    WorkingDirOutsideExecRoot {
        working_dir: PathBuf,
        exec_root: PathBuf,
    },

    #[error("invalid download regex '{pattern}': {source}")]
    InvalidDownloadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Stub(#[from] crate::stub::StubError),

    #[error(transparent)]
    ActionLog(#[from] crate::reproxy_log::ActionLogError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ActionError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The catalog entry that best explains this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WorkingDirOutsideExecRoot { .. } => ErrorCode::ConfigWorkingDirOutsideExecRoot,
            Self::InvalidDownloadRegex { .. } => ErrorCode::ConfigInvalidFlag,
            Self::Config(_) => ErrorCode::ConfigReadError,
            Self::Stub(_) => ErrorCode::DownloadStubFormat,
            Self::ActionLog(_) | Self::Io { .. } => ErrorCode::InternalIo,
        }
    }
}
