//! Command line of `remote-action`.
//!
//! Arguments before `--` belong to the wrapper. Flags it does not know are
//! passed through to rewrapper untouched, so clap only ever sees the known
//! ones (see [`split_known_args`]).

use clap::{CommandFactory, Parser};
use rbe_common::action::{ExecStrategy, RemoteActionConfig, RemoteLog};
use rbe_common::util::flatten_comma_list;
use std::path::{Path, PathBuf};

/// `--log` given without a value.
pub const AUTO_LOG_NAME: &str = "<AUTO>";

#[derive(Parser, Debug)]
#[command(name = "remote-action")]
#[command(version, about = "Executes a build action command remotely.")]
#[command(override_usage = "remote-action [OPTIONS] [REWRAPPER_OPTIONS] -- COMMAND [ARGS]...")]
pub struct Cli {
    /// rewrapper config file
    #[arg(long, value_name = "FILE", help_heading = "rewrapper")]
    pub cfg: Option<PathBuf>,

    /// rewrapper execution strategy
    #[arg(long = "exec_strategy", help_heading = "rewrapper")]
    pub exec_strategy: Option<ExecStrategy>,

    /// Additional remote inputs, comma-separated, relative to the working dir
    #[arg(long, value_name = "PATHS", help_heading = "rewrapper")]
    pub inputs: Vec<String>,

    /// Files listing additional inputs, relative to the working dir
    #[arg(long = "input_list_paths", value_name = "PATHS", help_heading = "rewrapper")]
    pub input_list_paths: Vec<String>,

    /// Additional remote output files, comma-separated
    #[arg(long = "output_files", value_name = "FILES", help_heading = "rewrapper")]
    pub output_files: Vec<String>,

    /// Additional remote output directories, comma-separated
    #[arg(long = "output_directories", value_name = "DIRS", help_heading = "rewrapper")]
    pub output_directories: Vec<String>,

    /// Remote execution parameters, merged over the value in --cfg
    #[arg(long, help_heading = "rewrapper")]
    pub platform: Option<String>,

    /// Directory holding rewrapper and remotetool
    #[arg(long, value_name = "PATH")]
    pub bindir: Option<PathBuf>,

    /// Disable remote execution, run the original command locally
    #[arg(long)]
    pub local: bool,

    /// Show the final command and exit
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Print additional information while running
    #[arg(long)]
    pub verbose: bool,

    /// Build system identifier, for diagnostic messages
    #[arg(long, default_value = "")]
    pub label: String,

    /// Run locally repeatedly and compare outputs (requires --local)
    #[arg(long = "check-determinism")]
    pub check_determinism: bool,

    /// For --check-determinism, the maximum number of re-runs
    #[arg(long = "determinism-attempts", default_value_t = 1)]
    pub determinism_attempts: u32,

    /// Capture remote stdout/stderr to BASE.remote-log
    #[arg(long, value_name = "BASE", num_args = 0..=1, require_equals = true, default_missing_value = AUTO_LOG_NAME)]
    pub log: Option<String>,

    /// Keep intermediate files that are normally cleaned up
    #[arg(long = "save-temps")]
    pub save_temps: bool,

    /// Obsolete, accepted and ignored
    #[arg(long = "auto-reproxy", hide = true)]
    pub auto_reproxy: bool,

    /// Trace file accesses with this fsatrace; empty selects the prebuilt one
    #[arg(long = "fsatrace-path", value_name = "PATH")]
    pub fsatrace_path: Option<String>,

    /// Run both remotely and locally and fail if outputs differ
    #[arg(long)]
    pub compare: bool,

    /// Where to save differing artifacts from --compare or --check-determinism
    #[arg(long = "miscomparison-export-dir", value_name = "DIR")]
    pub miscomparison_export_dir: Option<PathBuf>,

    /// On failure, scan reproxy logs for known problems
    #[arg(long = "diagnose-nonzero")]
    pub diagnose_nonzero: bool,

    /// Alternate command to run remotely, with the original action's setup
    #[arg(long = "remote-debug-command", value_name = "COMMAND")]
    pub remote_debug_command: Option<String>,

    /// Fetch outputs that were left remote right after success
    #[arg(long = "download-stubbed-outputs")]
    pub download_stubbed_outputs: bool,

    /// Fetch stubbed files one at a time
    #[arg(long = "sequential-downloads")]
    pub sequential_downloads: bool,
}

/// Separate wrapper flags from rewrapper flags, keeping relative order.
///
/// A known flag that takes a value may carry it inline (`--a=b`) or in the
/// next token, unless the flag requires `=`.
pub fn split_known_args(args: &[String]) -> (Vec<String>, Vec<String>) {
    let command = Cli::command();
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-h" || arg == "--help" || arg == "-V" || arg == "--version" {
            known.push(arg.clone());
            continue;
        }
        let Some(name) = arg.strip_prefix("--") else {
            unknown.push(arg.clone());
            continue;
        };
        let (name, inline) = match name.split_once('=') {
            Some((n, _)) => (n, true),
            None => (name, false),
        };
        let Some(spec) = command.get_arguments().find(|a| a.get_long() == Some(name)) else {
            unknown.push(arg.clone());
            continue;
        };
        known.push(arg.clone());
        let takes_value = spec.get_action().takes_values();
        if takes_value
            && !inline
            && !spec.is_require_equals_set()
            && let Some(value) = iter.next()
        {
            known.push(value.clone());
        }
    }
    (known, unknown)
}

fn paths(values: &[String]) -> Vec<PathBuf> {
    flatten_comma_list(values).into_iter().map(PathBuf::from).collect()
}

impl Cli {
    /// rewrapper location: `--bindir`, else the prebuilt reclient directory.
    pub fn rewrapper(&self, project_root_rel: &Path) -> PathBuf {
        self.bindir
            .clone()
            .unwrap_or_else(|| project_root_rel.join("prebuilt/reclient"))
            .join("rewrapper")
    }

    pub fn to_config(
        &self,
        project_root: &Path,
        working_dir: &Path,
        options: Vec<String>,
        command: Vec<String>,
    ) -> RemoteActionConfig {
        let project_root_rel = rbe_common::util::relpath(project_root, working_dir);
        let mut config = RemoteActionConfig::new(
            self.rewrapper(&project_root_rel),
            command,
            project_root,
            working_dir,
        );
        config.options = options;
        config.cfg = Some(
            self.cfg
                .clone()
                .unwrap_or_else(|| project_root_rel.join("build/rbe/rewrapper.cfg")),
        );
        config.exec_strategy = self.exec_strategy;
        config.inputs = paths(&self.inputs);
        config.input_list_paths = paths(&self.input_list_paths);
        config.output_files = paths(&self.output_files);
        config.output_dirs = paths(&self.output_directories);
        config.platform = self.platform.clone();
        config.disable = self.local;
        config.verbose = self.verbose;
        config.save_temps = self.save_temps;
        config.label = Some(self.label.clone());
        config.remote_log = match self.log.as_deref() {
            None | Some("") => None,
            Some(AUTO_LOG_NAME) => Some(RemoteLog::Auto),
            Some(base) => Some(RemoteLog::Named(base.to_string())),
        };
        config.fsatrace_path = self.fsatrace_path.as_deref().map(PathBuf::from);
        config.diagnose_nonzero = self.diagnose_nonzero;
        config.compare_with_local = self.compare;
        config.check_determinism = self.check_determinism;
        config.determinism_attempts = self.determinism_attempts;
        config.miscomparison_export_dir = self.miscomparison_export_dir.clone();
        config.remote_debug_command = self
            .remote_debug_command
            .as_deref()
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        config.download_stubbed_outputs = self.download_stubbed_outputs;
        config.parallel_downloads = !self.sequential_downloads;
        config
    }
}
