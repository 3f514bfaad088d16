//! Remote action configuration and the paths derived from it.
//!
//! [`RemoteActionConfig`] is what the caller asks for. [`ActionLayout`] is
//! everything computed from it once at construction: relative roots,
//! augmented input/output lists, the split between remote and local
//! commands, and the interpreted rewrapper options.

use crate::config::RbeEnvironment;
use crate::errors::ActionError;
use crate::flags::local_only_flag_forwarder;
use crate::platform::{merge_platform, platform_from_cfg};
use crate::util::{auto_env_prefix_command, bool_golang_flag, expand_paths_from_files, relpath};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Remote output capture script, relative to the exec root.
pub const REMOTE_LOG_SCRIPT: &str = "build/rbe/log-it.sh";
/// Prebuilt file-access tracer, relative to the exec root.
pub const DEFAULT_FSATRACE_PATH: &str = "prebuilt/fsatrace/fsatrace";
/// reproxy config used to configure remotetool, relative to the exec root.
pub const REPROXY_CFG: &str = "build/rbe/reproxy.cfg";
/// Auxiliary file basename when the action declares no output files.
pub const DEFAULT_AUX_BASENAME: &str = "rbe-action-output";

/// rewrapper `--exec_strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecStrategy {
    Local,
    #[default]
    Remote,
    RemoteLocalFallback,
    Racing,
}

impl ExecStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::RemoteLocalFallback => "remote_local_fallback",
            Self::Racing => "racing",
        }
    }

    /// Strategies under which the command may run on this host.
    pub fn involves_local(&self) -> bool {
        matches!(self, Self::Local | Self::RemoteLocalFallback | Self::Racing)
    }

    /// Strategies where a failed remote attempt can be redone locally.
    pub fn allows_local_rerun(&self) -> bool {
        matches!(self, Self::Local | Self::RemoteLocalFallback)
    }
}

impl fmt::Display for ExecStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "remote_local_fallback" => Ok(Self::RemoteLocalFallback),
            "racing" => Ok(Self::Racing),
            other => Err(format!("unknown exec_strategy: {other}")),
        }
    }
}

/// `--log` setting for remote stdout/stderr capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLog {
    /// Name the log after the auxiliary basename.
    Auto,
    /// `<base>.remote-log`.
    Named(String),
}

/// rewrapper options this wrapper interprets, read from the forwarded list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrapperOptions {
    pub canonicalize_working_dir: bool,
    pub download_outputs: bool,
    pub download_regex: Option<String>,
    pub preserve_unchanged_output_mtime: bool,
}

impl Default for RewrapperOptions {
    fn default() -> Self {
        Self {
            canonicalize_working_dir: false,
            download_outputs: true,
            download_regex: None,
            preserve_unchanged_output_mtime: false,
        }
    }
}

impl RewrapperOptions {
    /// Scan `--flag=value` and `--flag value` forms; later values win.
    pub fn parse<S: AsRef<str>>(options: &[S]) -> Self {
        let mut parsed = Self::default();
        let mut iter = options.iter().map(AsRef::as_ref);
        while let Some(opt) = iter.next() {
            let (name, inline) = match opt.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (opt, None),
            };
            match name {
                "--preserve_unchanged_output_mtime" => {
                    parsed.preserve_unchanged_output_mtime = true;
                }
                "--canonicalize_working_dir" | "--download_outputs" | "--download_regex" => {
                    let value = match inline {
                        Some(v) => v,
                        None => match iter.next() {
                            Some(v) => v.to_string(),
                            None => continue,
                        },
                    };
                    match name {
                        "--canonicalize_working_dir" => {
                            parsed.canonicalize_working_dir = bool_golang_flag(&value).unwrap_or(false);
                        }
                        "--download_outputs" => {
                            parsed.download_outputs = bool_golang_flag(&value).unwrap_or(true);
                        }
                        _ => parsed.download_regex = Some(value),
                    }
                }
                _ => {}
            }
        }
        parsed
    }

    /// True when some outputs are expected to be left remote.
    pub fn skipping_some_download(&self) -> bool {
        self.download_regex.is_some() || !self.download_outputs
    }
}

/// Which outputs get a download stub instead of being fetched.
#[derive(Debug, Clone)]
pub enum DownloadPolicy {
    /// `--download_outputs` decides for every path.
    All { download: bool },
    /// Paths matching are downloaded; others are stubbed.
    Include(Regex),
    /// Paths matching (after the leading `-`) are stubbed.
    Exclude(Regex),
}

impl DownloadPolicy {
    pub fn from_options(options: &RewrapperOptions) -> Result<Self, ActionError> {
        let Some(pattern) = &options.download_regex else {
            return Ok(Self::All {
                download: options.download_outputs,
            });
        };
        let (exclude, body) = match pattern.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        // anchored at the start only, like a prefix match
        let regex = Regex::new(&format!("^(?:{body})")).map_err(|source| ActionError::InvalidDownloadRegex {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(if exclude {
            Self::Exclude(regex)
        } else {
            Self::Include(regex)
        })
    }

    pub fn needs_download_stub(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        match self {
            Self::All { download } => !download,
            Self::Include(re) => !re.is_match(&text),
            Self::Exclude(re) => re.is_match(&text),
        }
    }
}

/// Everything a caller specifies about one remote action.
///
/// Input and output paths are relative to `working_dir`.
#[derive(Debug, Clone)]
pub struct RemoteActionConfig {
    pub rewrapper: PathBuf,
    /// Command to run remotely; `--local-only=` tokens are stripped from it.
    pub command: Vec<String>,
    /// Local equivalent, when it differs from the remote command.
    pub local_only_command: Option<Vec<String>>,
    /// Extra rewrapper options.
    pub options: Vec<String>,
    pub exec_root: PathBuf,
    pub working_dir: PathBuf,
    pub cfg: Option<PathBuf>,
    pub exec_strategy: Option<ExecStrategy>,
    pub inputs: Vec<PathBuf>,
    pub input_list_paths: Vec<PathBuf>,
    pub output_files: Vec<PathBuf>,
    pub output_dirs: Vec<PathBuf>,
    pub platform: Option<String>,
    /// Run locally only.
    pub disable: bool,
    pub verbose: bool,
    pub save_temps: bool,
    pub label: Option<String>,
    pub remote_log: Option<RemoteLog>,
    /// Empty path selects the prebuilt tracer.
    pub fsatrace_path: Option<PathBuf>,
    pub diagnose_nonzero: bool,
    pub compare_with_local: bool,
    pub check_determinism: bool,
    pub determinism_attempts: u32,
    pub miscomparison_export_dir: Option<PathBuf>,
    pub remote_debug_command: Vec<String>,
    /// Fetch outputs that were stubbed, right after the action succeeds.
    pub download_stubbed_outputs: bool,
    /// Fetch in parallel where possible.
    pub parallel_downloads: bool,
}

impl RemoteActionConfig {
    pub fn new(
        rewrapper: impl Into<PathBuf>,
        command: Vec<String>,
        exec_root: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rewrapper: rewrapper.into(),
            command,
            local_only_command: None,
            options: Vec::new(),
            exec_root: exec_root.into(),
            working_dir: working_dir.into(),
            cfg: None,
            exec_strategy: None,
            inputs: Vec::new(),
            input_list_paths: Vec::new(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            platform: None,
            disable: false,
            verbose: false,
            save_temps: false,
            label: None,
            remote_log: None,
            fsatrace_path: None,
            diagnose_nonzero: false,
            compare_with_local: false,
            check_determinism: false,
            determinism_attempts: 1,
            miscomparison_export_dir: None,
            remote_debug_command: Vec::new(),
            download_stubbed_outputs: false,
            parallel_downloads: true,
        }
    }
}

/// reclient's canonical working dir: `set_by_reclient/a/...`, same depth.
pub fn reclient_canonical_working_dir(build_subdir: &Path) -> PathBuf {
    let depth = build_subdir
        .components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .count();
    if depth == 0 {
        return PathBuf::new();
    }
    let mut canonical = PathBuf::from("set_by_reclient");
    for _ in 1..depth {
        canonical.push("a");
    }
    canonical
}

/// Values derived once from a [`RemoteActionConfig`].
#[derive(Debug, Clone)]
pub struct ActionLayout {
    pub exec_root: PathBuf,
    pub working_dir: PathBuf,
    /// working_dir relative to exec_root.
    pub build_subdir: PathBuf,
    pub remote_build_subdir: PathBuf,
    /// exec_root relative to working_dir, e.g. `../..`.
    pub exec_root_rel: PathBuf,
    /// Effective strategy; `--compare` forces remote.
    pub exec_strategy: Option<ExecStrategy>,
    pub rewrapper_options: RewrapperOptions,
    pub download_policy: DownloadPolicy,
    /// Only set when `--platform` was passed explicitly.
    pub merged_platform: Option<BTreeMap<String, String>>,
    pub remote_only_command: Vec<String>,
    pub local_only_flags: Vec<String>,
    pub local_only_command: Vec<String>,
    /// Inputs from `--inputs`, the list files, and added tooling.
    pub inputs: Vec<PathBuf>,
    /// Whether rewrapper gets an `--input_list_paths` file.
    pub needs_inputs_list: bool,
    pub output_files: Vec<PathBuf>,
    pub output_dirs: Vec<PathBuf>,
    pub aux_basename: String,
    pub remote_log_name: Option<PathBuf>,
    pub fsatrace_path: Option<PathBuf>,
    pub miscomparison_export_dir: Option<PathBuf>,
}

impl ActionLayout {
    pub fn resolve(config: &RemoteActionConfig, env: &RbeEnvironment) -> Result<Self, ActionError> {
        let build_subdir = config
            .working_dir
            .strip_prefix(&config.exec_root)
            .map_err(|_| ActionError::WorkingDirOutsideExecRoot {
                working_dir: config.working_dir.clone(),
                exec_root: config.exec_root.clone(),
            })?
            .to_path_buf();
        let exec_root_rel = relpath(&config.exec_root, &config.working_dir);

        let rewrapper_options = RewrapperOptions::parse(&config.options);
        let download_policy = DownloadPolicy::from_options(&rewrapper_options)?;
        let remote_build_subdir = if rewrapper_options.canonicalize_working_dir {
            reclient_canonical_working_dir(&build_subdir)
        } else {
            build_subdir.clone()
        };

        let exec_strategy = if config.compare_with_local {
            Some(ExecStrategy::Remote)
        } else {
            config.exec_strategy
        };

        let merged_platform = match &config.platform {
            Some(flag) => {
                let cfg_platform = match &config.cfg {
                    Some(cfg) => platform_from_cfg(&config.working_dir.join(cfg))?,
                    None => None,
                };
                Some(merge_platform(cfg_platform.as_deref(), env.platform(), Some(flag)))
            }
            None => None,
        };

        let (local_only_flags, remote_only_command) = local_only_flag_forwarder().sift(&config.command);
        let local_only_command = config.local_only_command.clone().unwrap_or_else(|| {
            let mut cmd = remote_only_command.clone();
            cmd.extend(local_only_flags.iter().cloned());
            cmd
        });

        let mut inputs = config.inputs.clone();
        for list in &config.input_list_paths {
            let list = config.working_dir.join(list);
            inputs.extend(
                expand_paths_from_files(std::slice::from_ref(&list)).map_err(|e| ActionError::io(&list, e))?,
            );
        }

        let mut output_files = config.output_files.clone();
        let aux_basename = output_files
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| DEFAULT_AUX_BASENAME.to_string());

        let remote_log_name = config.remote_log.as_ref().map(|log| match log {
            RemoteLog::Auto => PathBuf::from(format!("{aux_basename}.remote-log")),
            RemoteLog::Named(base) => PathBuf::from(format!("{base}.remote-log")),
        });
        if let Some(log) = &remote_log_name {
            output_files.push(log.clone());
            inputs.push(exec_root_rel.join(REMOTE_LOG_SCRIPT));
        }

        let fsatrace_path = config.fsatrace_path.as_ref().map(|p| {
            if p.as_os_str().is_empty() {
                exec_root_rel.join(DEFAULT_FSATRACE_PATH)
            } else {
                p.clone()
            }
        });
        if let Some(tracer) = &fsatrace_path {
            inputs.push(tracer.clone());
            inputs.push(tracer.with_extension("so"));
            output_files.push(PathBuf::from(format!("{aux_basename}.remote-fsatrace")));
        }

        Ok(Self {
            miscomparison_export_dir: config
                .miscomparison_export_dir
                .as_ref()
                .map(|d| config.working_dir.join(d)),
            exec_root: config.exec_root.clone(),
            working_dir: config.working_dir.clone(),
            build_subdir,
            remote_build_subdir,
            exec_root_rel,
            exec_strategy,
            rewrapper_options,
            download_policy,
            merged_platform,
            remote_only_command,
            local_only_flags,
            local_only_command,
            needs_inputs_list: !inputs.is_empty() || !config.input_list_paths.is_empty(),
            inputs,
            output_files,
            output_dirs: config.output_dirs.clone(),
            aux_basename,
            remote_log_name,
            fsatrace_path,
        })
    }

    /// The strategy rewrapper will apply (its default is remote).
    pub fn strategy(&self) -> ExecStrategy {
        self.exec_strategy.unwrap_or_default()
    }

    pub fn aux_file(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{suffix}", self.aux_basename))
    }

    /// rewrapper `--action_log` record for this action.
    pub fn action_log(&self) -> PathBuf {
        self.aux_file(".rrpl")
    }

    pub fn inputs_list_file(&self) -> PathBuf {
        self.aux_file(".inputs")
    }

    pub fn fsatrace_local_trace(&self) -> PathBuf {
        self.aux_file(".local-fsatrace")
    }

    pub fn fsatrace_remote_trace(&self) -> PathBuf {
        self.aux_file(".remote-fsatrace")
    }

    /// Generated script that re-applies `--local-only` flags.
    pub fn local_wrapper_filename(&self) -> PathBuf {
        let base = self
            .output_files
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_AUX_BASENAME));
        base.with_extension("local.sh")
    }

    pub fn remote_log_script_path(&self) -> PathBuf {
        self.exec_root_rel.join(REMOTE_LOG_SCRIPT)
    }

    pub fn remote_working_dir(&self) -> PathBuf {
        PathBuf::from(crate::compare::REMOTE_PROJECT_ROOT).join(&self.remote_build_subdir)
    }

    pub fn reproxy_cfg(&self) -> PathBuf {
        self.exec_root.join(REPROXY_CFG)
    }

    fn relativize_to_exec_root(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths
            .iter()
            .map(|p| relpath(&self.working_dir.join(p), &self.exec_root))
            .collect()
    }

    pub fn inputs_relative_to_exec_root(&self) -> Vec<PathBuf> {
        self.relativize_to_exec_root(&self.inputs)
    }

    pub fn output_files_relative_to_exec_root(&self) -> Vec<PathBuf> {
        self.relativize_to_exec_root(&self.output_files)
    }

    pub fn output_dirs_relative_to_exec_root(&self) -> Vec<PathBuf> {
        self.relativize_to_exec_root(&self.output_dirs)
    }

    pub fn remote_only_command(&self) -> Vec<String> {
        auto_env_prefix_command(self.remote_only_command.clone())
    }

    pub fn local_only_command(&self) -> Vec<String> {
        auto_env_prefix_command(self.local_only_command.clone())
    }

    pub fn commands_differ(&self) -> bool {
        self.local_only_command != self.remote_only_command
    }
}
