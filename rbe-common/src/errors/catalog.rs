//! Error catalog for remote actions.
//!
//! Each entry has a stable code (RBE-E001 through RBE-E599), a message,
//! and remediation steps. Diagnostics report their findings as entries from
//! this catalog so the same explanation is printed for the same problem.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Wrapper flags, config files, environment |
//! | E100-E199  | Remote      | rewrapper/reproxy execution failures     |
//! | E200-E299  | Download    | Download stubs and artifact retrieval    |
//! | E300-E399  | Compare     | Local/remote and determinism comparisons |
//! | E500-E599  | Internal    | Internal/unexpected errors               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering remote-action failure scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// rewrapper config file not found
    ConfigNotFound,
    /// Config file could not be read
    ConfigReadError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Working directory is not inside exec_root
    ConfigWorkingDirOutsideExecRoot,
    /// Missing `--` separator or unusable wrapper flag
    ConfigInvalidFlag,

    // =========================================================================
    // Remote Errors (E100-E199)
    // =========================================================================
    /// rewrapper could not connect to reproxy
    RemoteFailToDial,
    /// Caller lacks permission on the RBE instance
    RemotePermissionDenied,
    /// A local input file needed for upload is missing
    RemoteMissingInput,
    /// reclient internal error (exit 35)
    RemoteReclientError,
    /// Remote execution server error (exit 45)
    RemoteServerError,
    /// Process killed by signal (exit 137)
    RemoteKilled,
    /// Command or outputs reference the non-canonical build directory
    RemoteOutputDirLeak,

    // =========================================================================
    // Download Errors (E200-E299)
    // =========================================================================
    /// Fetching an artifact from the CAS failed
    DownloadFailed,
    /// File is not a well-formed download stub
    DownloadStubFormat,
    /// Could not acquire the per-path download lock
    DownloadLockFailed,
    /// Parallel downloads unavailable; fetched sequentially
    DownloadSequentialFallback,

    // =========================================================================
    // Compare Errors (E300-E399)
    // =========================================================================
    /// Local and remote outputs differ
    CompareMismatch,
    /// Local re-run for comparison failed
    CompareLocalFailed,
    /// Repeated local runs produced different outputs
    DeterminismMismatch,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Unexpected I/O failure
    InternalIo,
    /// Logging system error
    InternalLoggingError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigEnvError => 3,
            Self::ConfigWorkingDirOutsideExecRoot => 4,
            Self::ConfigInvalidFlag => 5,

            Self::RemoteFailToDial => 100,
            Self::RemotePermissionDenied => 101,
            Self::RemoteMissingInput => 102,
            Self::RemoteReclientError => 103,
            Self::RemoteServerError => 104,
            Self::RemoteKilled => 105,
            Self::RemoteOutputDirLeak => 106,

            Self::DownloadFailed => 200,
            Self::DownloadStubFormat => 201,
            Self::DownloadLockFailed => 202,
            Self::DownloadSequentialFallback => 203,

            Self::CompareMismatch => 300,
            Self::CompareLocalFailed => 301,
            Self::DeterminismMismatch => 302,

            Self::InternalIo => 500,
            Self::InternalLoggingError => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "RBE-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("RBE-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Remote,
            200..=299 => ErrorCategory::Download,
            300..=399 => ErrorCategory::Compare,
            _ => ErrorCategory::Internal,
        }
    }

    /// Map one of rewrapper's special exit statuses to its catalog entry.
    #[must_use]
    pub const fn for_exit_code(code: i32) -> Option<Self> {
        match code {
            35 => Some(Self::RemoteReclientError),
            45 => Some(Self::RemoteServerError),
            137 => Some(Self::RemoteKilled),
            _ => None,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "rewrapper configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::ConfigWorkingDirOutsideExecRoot => {
                "Working directory is not a subdirectory of exec_root"
            }
            Self::ConfigInvalidFlag => "Invalid wrapper invocation",

            Self::RemoteFailToDial => "rewrapper could not reach reproxy (Fail to dial)",
            Self::RemotePermissionDenied => "Permission denied by the remote execution service",
            Self::RemoteMissingInput => "A local input file for upload is missing",
            Self::RemoteReclientError => "reclient reported an internal error",
            Self::RemoteServerError => "Remote execution server error",
            Self::RemoteKilled => "Process was killed by a signal",
            Self::RemoteOutputDirLeak => {
                "Command references the local build directory under a canonicalized working dir"
            }

            Self::DownloadFailed => "Failed to download artifact",
            Self::DownloadStubFormat => "File is not a valid download stub",
            Self::DownloadLockFailed => "Failed to acquire download lock",
            Self::DownloadSequentialFallback => {
                "Parallel downloads unavailable, downloading sequentially"
            }

            Self::CompareMismatch => "Local and remote outputs differ",
            Self::CompareLocalFailed => "Local execution for comparison failed",
            Self::DeterminismMismatch => "Repeated local executions produced different outputs",

            Self::InternalIo => "Unexpected I/O failure",
            Self::InternalLoggingError => "Failed to initialize logging",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Pass --cfg with the path to a rewrapper config file",
                "Check that the project root was detected correctly",
            ],
            Self::ConfigReadError => &["Check file permissions on the config file"],
            Self::ConfigEnvError => &["Fix or unset the reported environment variable"],
            Self::ConfigWorkingDirOutsideExecRoot => &[
                "Run from a directory under the project root",
                "Set REMOTE_ACTION_PROJECT_ROOT to an ancestor of the working directory",
            ],
            Self::ConfigInvalidFlag => &[
                "Separate wrapper flags from the command with '--'",
                "Forwarded rewrapper flags must use the --flag=value form",
            ],

            Self::RemoteFailToDial => &[
                "reproxy may not be running; wrap the build with the reproxy wrapper",
                "'Proxy started successfully.' in the logs indicates reproxy is up",
            ],
            Self::RemotePermissionDenied => &[
                "Check that your credentials grant access to the RBE instance",
                "Contact the build infrastructure team for access",
            ],
            Self::RemoteMissingInput => &[
                "Declare the missing file as an input of the action",
                "If it is a generated file, add a dependency on the action that produces it",
            ],
            Self::RemoteReclientError => &["Retry; inspect rewrapper logs if the error persists"],
            Self::RemoteServerError => &["Retry; remote blob transfers can fail transiently"],
            Self::RemoteKilled => &[
                "The action may have run out of memory",
                "Request a larger worker via --platform",
            ],
            Self::RemoteOutputDirLeak => &[
                "Use paths relative to the working directory in the command",
                "Or disable --canonicalize_working_dir for this action",
            ],

            Self::DownloadFailed => &[
                "Check connectivity to the CAS",
                "Artifacts may have expired; rebuild the producing action",
            ],
            Self::DownloadStubFormat => &["Delete the file and rebuild the action that produced it"],
            Self::DownloadLockFailed => &["Check permissions on the .dl-locks directory"],
            Self::DownloadSequentialFallback => &[
                "Make shared memory writable in the sandbox to enable parallel downloads",
            ],

            Self::CompareMismatch => &[
                "Inspect the reported diff for absolute paths or timestamps",
                "Use --miscomparison-export-dir to save artifacts for analysis",
            ],
            Self::CompareLocalFailed => &["Run the command locally to reproduce the failure"],
            Self::DeterminismMismatch => &[
                "Look for timestamps, random seeds, or unordered iteration in the tool",
                "Use --miscomparison-export-dir to save both variants",
            ],

            Self::InternalIo => &["Check disk space and permissions"],
            Self::InternalLoggingError => &["Check REMOTE_ACTION_LOG_FILE is writable"],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigEnvError,
            Self::ConfigWorkingDirOutsideExecRoot,
            Self::ConfigInvalidFlag,
            Self::RemoteFailToDial,
            Self::RemotePermissionDenied,
            Self::RemoteMissingInput,
            Self::RemoteReclientError,
            Self::RemoteServerError,
            Self::RemoteKilled,
            Self::RemoteOutputDirLeak,
            Self::DownloadFailed,
            Self::DownloadStubFormat,
            Self::DownloadLockFailed,
            Self::DownloadSequentialFallback,
            Self::CompareMismatch,
            Self::CompareLocalFailed,
            Self::DeterminismMismatch,
            Self::InternalIo,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Wrapper flags, config files, environment (E001-E099)
    Config,
    /// rewrapper/reproxy execution failures (E100-E199)
    Remote,
    /// Download stubs and artifact retrieval (E200-E299)
    Download,
    /// Local/remote and determinism comparisons (E300-E399)
    Compare,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Remote => "Remote execution",
            Self::Download => "Download",
            Self::Compare => "Comparison",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "RBE-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
