//! Snapshot of the environment variables this tool consumes.
//!
//! Captured once at process start and passed down explicitly, so nothing
//! below `main` reads the process environment.

use super::env::{EnvError, EnvParser};
use super::source::Sourced;
use std::path::{Path, PathBuf};

/// Directory whose presence marks the project root.
pub const PROJECT_ROOT_MARKER: &str = "build/rbe";

/// Values read from the environment, with their provenance.
#[derive(Debug, Clone)]
pub struct RbeEnvironment {
    /// `RBE_proxy_log_dir`: reproxy log directory (unique per build).
    pub proxy_log_dir: Sourced<Option<PathBuf>>,
    /// `RBE_log_dir`: per-invocation rewrapper log directory.
    pub rewrapper_log_dir: Sourced<Option<PathBuf>>,
    /// `RBE_platform`: platform override string.
    pub platform: Sourced<Option<String>>,
    /// `TMPDIR`, passed through to subprocesses.
    pub tmpdir: Sourced<Option<PathBuf>>,
    /// `REMOTE_ACTION_PROFILE_OUTPUT`, passed through to subprocesses.
    pub profile_output: Sourced<Option<PathBuf>>,
    /// `REMOTE_ACTION_PROJECT_ROOT`: overrides project root discovery.
    pub project_root: Sourced<Option<PathBuf>>,
}

impl RbeEnvironment {
    /// Capture the current process environment.
    pub fn capture() -> (Self, Vec<EnvError>) {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable set.
    pub fn from_vars<I>(vars: I) -> (Self, Vec<EnvError>)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let mut rbe = EnvParser::from_vars("RBE_", vars.iter().cloned());
        let mut ours = EnvParser::from_vars("REMOTE_ACTION_", vars.iter().cloned());
        let mut plain = EnvParser::from_vars("", vars.iter().cloned());

        let snapshot = Self {
            proxy_log_dir: rbe.get_optional_path("proxy_log_dir", false),
            rewrapper_log_dir: rbe.get_optional_path("log_dir", false),
            platform: rbe.get_optional_string("platform"),
            tmpdir: plain.get_optional_path("TMPDIR", false),
            profile_output: ours.get_optional_path("PROFILE_OUTPUT", false),
            project_root: ours.get_optional_path("PROJECT_ROOT", true),
        };

        let mut errors = rbe.take_errors();
        errors.extend(ours.take_errors());
        errors.extend(plain.take_errors());
        (snapshot, errors)
    }

    /// An environment with nothing set.
    pub fn empty() -> Self {
        Self::from_vars(std::iter::empty()).0
    }

    pub fn proxy_log_dir(&self) -> Option<&Path> {
        self.proxy_log_dir.value.as_deref()
    }

    pub fn rewrapper_log_dir(&self) -> Option<&Path> {
        self.rewrapper_log_dir.value.as_deref()
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.value.as_deref()
    }

    /// Build id used when writing download stubs: the (unique per build)
    /// reproxy log directory name.
    pub fn build_id(&self) -> String {
        self.proxy_log_dir()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// `REMOTE_ACTION_PROJECT_ROOT` if set, else the nearest ancestor of
    /// `working_dir` containing `build/rbe`, else `working_dir` itself.
    pub fn project_root_for(&self, working_dir: &Path) -> PathBuf {
        if let Some(root) = &self.project_root.value {
            let root = working_dir.join(root);
            return std::fs::canonicalize(&root).unwrap_or(root);
        }
        working_dir
            .ancestors()
            .find(|dir| dir.join(PROJECT_ROOT_MARKER).is_dir())
            .unwrap_or(working_dir)
            .to_path_buf()
    }

    /// Variables to forward unchanged to launched subprocesses.
    pub fn passthrough_vars(&self) -> Vec<(String, PathBuf)> {
        let mut vars = Vec::new();
        if let Some(tmp) = &self.tmpdir.value {
            vars.push(("TMPDIR".to_string(), tmp.clone()));
        }
        if let Some(profile) = &self.profile_output.value {
            vars.push(("REMOTE_ACTION_PROFILE_OUTPUT".to_string(), profile.clone()));
        }
        vars
    }
}

impl Default for RbeEnvironment {
    fn default() -> Self {
        Self::empty()
    }
}
