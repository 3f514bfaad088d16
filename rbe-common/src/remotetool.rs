//! Narrow interface to the CAS blob-fetch tool.
//!
//! Downloads go through the [`Downloader`] trait so the stub and batch code
//! can be exercised with an in-process fake. [`RemoteTool`] is the real
//! implementation that shells out to reclient's `remotetool`.

use crate::config::{ConfigError, read_config_file};
use crate::subprocess::{CallOptions, SubprocessResult, subprocess_call};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fetches artifacts by digest.
pub trait Downloader: Send + Sync {
    /// Fetch a single file blob to `path` (relative to `cwd`).
    fn download_blob(&self, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult;

    /// Fetch a directory tree to `path` (relative to `cwd`).
    fn download_dir(&self, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult;
}

/// reproxy config keys that remotetool understands as flags.
const FORWARDED_CFG_KEYS: &[&str] = &[
    "service",
    "instance",
    "use_application_default_credentials",
    "use_gce_credentials",
    "credential_file",
    "service_no_auth",
    "service_no_security",
    "tls_ca_cert",
];

/// `remotetool` invocation settings.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    tool: PathBuf,
    cfg: BTreeMap<String, String>,
}

impl RemoteTool {
    pub fn new(tool: impl Into<PathBuf>, cfg: BTreeMap<String, String>) -> Self {
        Self {
            tool: tool.into(),
            cfg,
        }
    }

    /// Configure from a reproxy config file.
    pub fn from_reproxy_cfg(tool: impl Into<PathBuf>, cfg: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(tool, read_config_file(cfg)?))
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    fn base_command(&self) -> Vec<String> {
        let mut cmd = vec![self.tool.display().to_string()];
        for key in FORWARDED_CFG_KEYS {
            if let Some(value) = self.cfg.get(*key) {
                cmd.push(format!("--{key}={value}"));
            }
        }
        cmd
    }

    fn run(&self, operation: &str, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult {
        let mut cmd = self.base_command();
        cmd.push(format!("--operation={operation}"));
        cmd.push(format!("--digest={digest}"));
        cmd.push(format!("--path={}", path.display()));
        debug!(operation, digest, path = %path.display(), "remotetool");
        subprocess_call(&cmd, &CallOptions::in_dir(cwd).quiet(true))
    }
}

impl Downloader for RemoteTool {
    fn download_blob(&self, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult {
        self.run("download_blob", path, digest, cwd)
    }

    fn download_dir(&self, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult {
        self.run("download_dir", path, digest, cwd)
    }
}
