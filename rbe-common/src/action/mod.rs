//! Running one build action through rewrapper.
//!
//! A [`RemoteAction`] owns everything needed to launch a command remotely
//! and clean up after it: the one-time retry of flaky infrastructure
//! failures, download stubs for outputs that were left remote, optional
//! local re-execution for comparison, and log analysis on failure.

mod command;
pub mod config;
pub mod retry;

pub use config::{
    ActionLayout, DownloadPolicy, ExecStrategy, RemoteActionConfig, RemoteLog, RewrapperOptions,
    reclient_canonical_working_dir,
};
pub use retry::{RetryReason, retry_reason, should_retry_remote_action};

use crate::compare::{
    CompareLayout, backup_remote_outputs, compare_fsatraces, compare_output_pairs,
    expand_common_files_between_dirs, export_mismatches, report_mismatches,
};
use crate::config::RbeEnvironment;
use crate::determinism::DeterminismCheck;
use crate::diagnostics::analyze_rbe_logs;
use crate::digest::get_blob_digest;
use crate::download::{download_input_stub_paths_batch, download_output_stub_infos_batch, first_failure};
use crate::errors::{ActionError, ErrorCode};
use crate::leak_scan::{PathPattern, preflight_checks};
use crate::logging::msg;
use crate::remotetool::{Downloader, RemoteTool};
use crate::reproxy_log::ReproxyLogEntry;
use crate::stub::{DownloadStubInfo, download_file_to_path, download_stub_backup_location, is_download_stub_file};
use crate::subprocess::{CallOptions, SubprocessResult, subprocess_call};
use crate::util::{command_quoted_str, remove_path, write_lines};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extra step after a successful action, e.g. depfile rewriting.
/// A nonzero return becomes the action's exit code.
pub type PostSuccessAction = Box<dyn Fn() -> i32>;

/// What [`RemoteAction::update_stub`] did with an output path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubUpdate {
    Written,
    /// Content is unchanged, the existing file (and its mtime) were kept.
    Preserved,
}

pub struct RemoteAction {
    config: RemoteActionConfig,
    layout: ActionLayout,
    env: RbeEnvironment,
    downloader: Option<Arc<dyn Downloader>>,
    post_success: Option<PostSuccessAction>,
    cleanup_files: Vec<PathBuf>,
}

impl RemoteAction {
    pub fn new(config: RemoteActionConfig, env: RbeEnvironment) -> Result<Self, ActionError> {
        let layout = ActionLayout::resolve(&config, &env)?;
        Ok(Self {
            config,
            layout,
            env,
            downloader: None,
            post_success: None,
            cleanup_files: Vec::new(),
        })
    }

    /// Use `downloader` instead of remotetool.
    #[must_use]
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    #[must_use]
    pub fn with_post_success_action(mut self, action: PostSuccessAction) -> Self {
        self.post_success = Some(action);
        self
    }

    pub fn config(&self) -> &RemoteActionConfig {
        &self.config
    }

    pub fn layout(&self) -> &ActionLayout {
        &self.layout
    }

    /// The injected downloader, or remotetool next to rewrapper configured
    /// from the project's reproxy.cfg.
    pub fn downloader(&self) -> Result<Arc<dyn Downloader>, ActionError> {
        if let Some(downloader) = &self.downloader {
            return Ok(Arc::clone(downloader));
        }
        let tool = self
            .config
            .rewrapper
            .parent()
            .unwrap_or(Path::new(""))
            .join("remotetool");
        let remotetool = RemoteTool::from_reproxy_cfg(tool, &self.layout.reproxy_cfg())?;
        Ok(Arc::new(remotetool))
    }

    fn vmsg(&self, text: impl AsRef<str>) {
        debug!("{}", text.as_ref());
        if self.config.verbose {
            msg(text);
        }
    }

    fn call_options(&self, quiet: bool) -> CallOptions {
        let mut options = CallOptions::in_dir(&self.layout.working_dir).quiet(quiet);
        for (name, value) in self.env.passthrough_vars() {
            options.env.insert(name, value.display().to_string());
        }
        options
    }

    /// Local re-execution only makes sense when rewrapper would not already
    /// have tried it, and when it would run something different.
    pub fn should_rerun_locally_on_failure(&self) -> bool {
        self.layout.strategy().allows_local_rerun() && self.layout.commands_differ()
    }

    /// Print (or with `dry_run`, only print) the command, then run it.
    pub fn run_with_dry_run(&mut self, dry_run: bool) -> i32 {
        let command = command_quoted_str(&self.launch_command());
        if dry_run {
            let label = match &self.config.label {
                Some(label) if !label.is_empty() => format!(" [{label}]"),
                _ => String::new(),
            };
            msg(format!("[dry-run only]{label} {command}"));
            return 0;
        }
        if self.config.verbose {
            msg(&command);
        }
        self.run()
    }

    /// Run the action and post-process its outputs. Returns the exit code.
    pub fn run(&mut self) -> i32 {
        info!(
            label = self.config.label.as_deref().unwrap_or(""),
            strategy = %self.layout.strategy(),
            local = self.config.disable,
            "running action"
        );
        let status = self.run_steps();
        if self.config.save_temps {
            debug!(files = self.cleanup_files.len(), "keeping temporary files");
        } else {
            self.cleanup();
        }
        info!(status, "action finished");
        status
    }

    fn run_steps(&mut self) -> i32 {
        let subdir = &self.layout.build_subdir;
        if self.layout.rewrapper_options.canonicalize_working_dir
            && !subdir.as_os_str().is_empty()
            && subdir != Path::new(".")
        {
            let status = preflight_checks(
                &self.layout.output_files,
                &self.layout.local_only_command(),
                &PathPattern::new(subdir),
            );
            if status != 0 {
                msg(format!(
                    "Error: Detected local output dir leaks '{}' in the command.  Aborting remote execution.",
                    subdir.display()
                ));
                return status;
            }
        }

        let remote_debugging = !self.config.remote_debug_command.is_empty();
        if let Err(e) = self.prepare_files(!self.config.disable || remote_debugging) {
            warn!(code = %e.code().code_string(), error = %e, "failed to prepare action files");
            msg(format!("Error: {e}"));
            return 1;
        }

        if remote_debugging {
            self.remote_debug();
            return 1;
        }

        if self.layout.strategy().involves_local() {
            let status = self.download_inputs();
            if status != 0 {
                return status;
            }
        }

        let mut result = self.run_maybe_remotely();
        if !self.config.disable
            && let Some(reason) = retry_reason(&result)
        {
            info!(?reason, code = result.returncode, "retrying remote action");
            msg("One-time retry for a possible remote-execution flake.");
            result = self.run_maybe_remotely();
        }

        if result.success() {
            self.on_success()
        } else {
            self.on_failure(&result)
        }
    }

    /// Write the input list (for remote runs) and the local wrapper script.
    fn prepare_files(&mut self, remote: bool) -> Result<(), ActionError> {
        let wd = self.layout.working_dir.clone();
        if remote && self.layout.needs_inputs_list {
            let list = wd.join(self.layout.inputs_list_file());
            let inputs = self.layout.inputs_relative_to_exec_root();
            write_lines(&list, inputs.iter().map(|p| p.display().to_string()))
                .map_err(|e| ActionError::io(&list, e))?;
            self.cleanup_files.push(list);
        }

        if !self.layout.local_only_flags.is_empty() {
            let wrapper = wd.join(self.layout.local_wrapper_filename());
            if let Some(parent) = wrapper.parent() {
                fs::create_dir_all(parent).map_err(|e| ActionError::io(parent, e))?;
            }
            fs::write(&wrapper, self.local_wrapper_text()).map_err(|e| ActionError::io(&wrapper, e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&wrapper, fs::Permissions::from_mode(0o700))
                    .map_err(|e| ActionError::io(&wrapper, e))?;
            }
            self.cleanup_files.push(wrapper);
        }
        Ok(())
    }

    /// Fetch stubbed inputs that live in the build output tree, before
    /// anything may run locally.
    fn download_inputs(&self) -> i32 {
        let exec_root_rel = &self.layout.exec_root_rel;
        let candidates: Vec<PathBuf> = self
            .layout
            .inputs
            .iter()
            .filter(|p| !p.starts_with(exec_root_rel))
            .filter(|p| is_download_stub_file(&self.layout.working_dir.join(p)))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let downloader = match self.downloader() {
            Ok(d) => d,
            Err(e) => {
                msg(format!("Error: cannot download inputs: {e}"));
                return 1;
            }
        };
        let statuses = match download_input_stub_paths_batch(
            downloader,
            &candidates,
            &self.layout.working_dir,
            self.config.parallel_downloads,
        ) {
            Ok(statuses) => statuses,
            Err(e) => {
                msg(format!("Error: input downloads failed: {e}"));
                return 1;
            }
        };
        if let Some((path, status)) = first_failure(&statuses) {
            msg(format!(
                "Downloading local action input {} failed:\n{}",
                path.display(),
                status.stderr_text()
            ));
            return status.returncode;
        }
        0
    }

    fn run_maybe_remotely(&self) -> SubprocessResult {
        let quiet = self.should_rerun_locally_on_failure();
        if self.config.disable {
            return self.execute_locally(quiet);
        }
        let command = self.remote_launch_command();
        self.vmsg(format!("Launching: {}", command_quoted_str(&command)));
        subprocess_call(&command, &self.call_options(quiet))
    }

    fn determinism_check(&self) -> DeterminismCheck {
        DeterminismCheck {
            exec_root: self.layout.exec_root.clone(),
            working_dir: self.layout.working_dir.clone(),
            outputs: self.layout.output_files.clone(),
            inputs: self.layout.inputs_relative_to_exec_root(),
            attempts: self.config.determinism_attempts,
            export_dir: self.layout.miscomparison_export_dir.clone(),
        }
    }

    fn execute_locally(&self, quiet: bool) -> SubprocessResult {
        let command = self.local_launch_command();
        let options = self.call_options(quiet);
        if !self.config.check_determinism {
            return subprocess_call(&command, &options);
        }
        match self.determinism_check().run(|| subprocess_call(&command, &options)) {
            Ok(status) => SubprocessResult::with_code(status),
            Err(e) => {
                msg(format!("Error: determinism check failed: {e}"));
                SubprocessResult::with_code(1)
            }
        }
    }

    /// Run the local command, e.g. after a remote failure or for comparison.
    pub fn run_locally(&self) -> i32 {
        let command = self.local_launch_command();
        self.vmsg(format!("Executing command locally: {}", command_quoted_str(&command)));
        let result = self.execute_locally(false);
        if !result.success() {
            msg(format!(
                "Local command failed for comparison (exit={}): {}",
                result.returncode,
                command_quoted_str(&command)
            ));
        }
        result.returncode
    }

    fn on_success(&self) -> i32 {
        if self.config.disable {
            return 0;
        }

        let skipping = self.layout.rewrapper_options.skipping_some_download();
        if skipping {
            match self.process_download_stubs() {
                Ok(0) => {}
                Ok(status) => return status,
                Err(e) => {
                    warn!(code = %e.code().code_string(), error = %e, "download stubs failed");
                    msg(format!("Error: {e}"));
                    return 1;
                }
            }
        }

        if let Some(action) = &self.post_success {
            let status = action();
            if status != 0 {
                return status;
            }
        }

        if self.config.compare_with_local {
            if !skipping {
                return self.compare_against_local();
            }
            msg("Cannot compare remote outputs as requested because --download_outputs=false.  Re-run with downloads enabled to compare outputs.");
        }
        0
    }

    fn on_failure(&self, result: &SubprocessResult) -> i32 {
        if let Some(code) = ErrorCode::for_exit_code(result.returncode) {
            warn!(code = %code.code_string(), status = result.returncode, "remote action failed");
        }

        if self.should_rerun_locally_on_failure() {
            let status = self.run_locally();
            if status == 0 {
                self.show_local_remote_command_differences();
            }
            return status;
        }

        if !self.layout.strategy().allows_local_rerun() && self.config.diagnose_nonzero {
            let action_log = self.layout.working_dir.join(self.layout.action_log());
            analyze_rbe_logs(&self.env, result.pid, Some(&action_log));
        }
        result.returncode
    }

    /// Replace remote-only outputs with download stubs, then optionally
    /// fetch them. Returns the first failing download status.
    fn process_download_stubs(&self) -> Result<i32, ActionError> {
        let record = ReproxyLogEntry::parse_action_log(&self.layout.working_dir.join(self.layout.action_log()))?;
        if record.completed_locally() {
            self.vmsg("Action completed locally, no download stubs needed.");
            return Ok(0);
        }

        let build_id = self.env.build_id();
        let stubs = record.make_download_stubs(&self.layout.output_files, &self.layout.output_dirs, &build_id);
        let mut stubbed = Vec::new();
        for info in stubs.into_values() {
            if !self.layout.download_policy.needs_download_stub(&info.path) {
                continue;
            }
            match self.update_stub(&info)? {
                StubUpdate::Written => self.vmsg(format!("Wrote download stub: {}", info.path.display())),
                StubUpdate::Preserved => self.vmsg(format!("Unchanged output kept: {}", info.path.display())),
            }
            stubbed.push(info);
        }

        if !self.config.download_stubbed_outputs || stubbed.is_empty() {
            return Ok(0);
        }
        let statuses = download_output_stub_infos_batch(
            self.downloader()?,
            &stubbed,
            &self.layout.working_dir,
            self.config.parallel_downloads,
        )
        .map_err(|e| ActionError::io(&self.layout.working_dir, e))?;
        Ok(match first_failure(&statuses) {
            Some((path, status)) => {
                msg(format!(
                    "Downloading output {} failed:\n{}",
                    path.display(),
                    status.stderr_text()
                ));
                status.returncode
            }
            None => 0,
        })
    }

    /// Write a stub for `info`, unless `--preserve_unchanged_output_mtime`
    /// is set and the existing file already has that content.
    pub fn update_stub(&self, info: &DownloadStubInfo) -> Result<StubUpdate, ActionError> {
        let wd = &self.layout.working_dir;
        let path = wd.join(&info.path);
        if !self.layout.rewrapper_options.preserve_unchanged_output_mtime || !path.exists() {
            info.create(wd, None)?;
            return Ok(StubUpdate::Written);
        }

        if is_download_stub_file(&path) {
            let old = DownloadStubInfo::read_from_file(&path)?;
            if old.blob_digest == info.blob_digest {
                return Ok(StubUpdate::Preserved);
            }
            info.create(wd, None)?;
            return Ok(StubUpdate::Written);
        }

        // A downloaded artifact keeps its stub as a backup, which is cheaper
        // to consult than hashing the artifact.
        let backup = download_stub_backup_location(&path);
        let old_digest = if backup.is_file() {
            Some(DownloadStubInfo::read_from_file(&backup)?.blob_digest)
        } else if path.is_file() {
            Some(get_blob_digest(&path).map_err(|e| ActionError::io(&path, e))?)
        } else {
            None
        };
        if old_digest.as_deref() == Some(info.blob_digest.as_str()) {
            return Ok(StubUpdate::Preserved);
        }
        if backup.exists() {
            fs::remove_file(&backup).map_err(|e| ActionError::io(&backup, e))?;
        }
        remove_path(&path).map_err(|e| ActionError::io(&path, e))?;
        info.create(wd, None)?;
        Ok(StubUpdate::Written)
    }

    /// Fetch one output named in the action log, e.g. from a failed action.
    /// Outputs the log does not know about are silently skipped.
    pub fn download_output_file(&self, path: &Path) -> i32 {
        let log = self.layout.working_dir.join(self.layout.action_log());
        let record = match ReproxyLogEntry::parse_action_log(&log) {
            Ok(record) => record,
            Err(e) => {
                msg(format!("Error: {e}"));
                return 1;
            }
        };
        let Some(digest) = record.output_file_digests.get(path) else {
            self.vmsg(format!("No digest recorded for {}, not downloading.", path.display()));
            return 0;
        };
        let downloader = match self.downloader() {
            Ok(d) => d,
            Err(e) => {
                msg(format!("Error: {e}"));
                return 1;
            }
        };
        download_file_to_path(
            downloader.as_ref(),
            &self.layout.working_dir,
            path,
            digest,
            Some(record.action_digest.as_str()),
        )
        .verbose_returncode(&format!("download {}", path.display()))
    }

    fn compare_layout(&self) -> CompareLayout {
        CompareLayout {
            exec_root: self.layout.exec_root.clone(),
            working_dir: self.layout.working_dir.clone(),
            build_subdir: self.layout.build_subdir.clone(),
            remote_build_subdir: self.layout.remote_build_subdir.clone(),
        }
    }

    /// Re-run locally and compare against the remote outputs.
    ///
    /// Returns 1 when outputs differ, otherwise the local run's status.
    pub fn compare_against_local(&self) -> i32 {
        self.vmsg("Comparing remote outputs against a local run.");
        let wd = &self.layout.working_dir;
        let backups = match backup_remote_outputs(wd, &self.layout.output_files, &self.layout.output_dirs) {
            Ok(backups) => backups,
            Err(e) => {
                msg(format!("Error: could not set aside remote outputs: {e}"));
                return 1;
            }
        };

        let status = self.run_locally();
        if status != 0 {
            return status;
        }

        let compare = self.compare_layout();
        let mismatches = self.expand_output_pairs(&backups.files, &backups.dirs).and_then(|pairs| {
            compare_output_pairs(&compare, &pairs)
        });
        let mismatches = match mismatches {
            Ok(m) => m,
            Err(e) => {
                msg(format!("Error: comparing outputs failed: {e}"));
                return 1;
            }
        };
        if mismatches.is_empty() {
            return 0;
        }

        report_mismatches(&mismatches);
        warn!(
            code = %ErrorCode::CompareMismatch.code_string(),
            count = mismatches.len(),
            "local and remote outputs differ"
        );

        if let Some(export_dir) = &self.layout.miscomparison_export_dir {
            match export_mismatches(
                &compare,
                &mismatches,
                &self.layout.inputs_relative_to_exec_root(),
                export_dir,
            ) {
                Ok(()) => msg(format!("Copied differing outputs and inputs to {}", export_dir.display())),
                Err(e) => msg(format!("Error: export to {} failed: {e}", export_dir.display())),
            }
        }

        if self.layout.fsatrace_path.is_some() {
            let local_trace = wd.join(self.layout.fsatrace_local_trace());
            let remote_trace = wd.join(self.layout.fsatrace_remote_trace());
            match compare_fsatraces(&compare, &local_trace, &remote_trace) {
                Ok(diff) => {
                    for line in &diff.stdout {
                        println!("{line}");
                    }
                }
                Err(e) => msg(format!("Error: comparing file access traces failed: {e}")),
            }
        }

        self.show_local_remote_command_differences();
        1
    }

    /// File pairs plus the files common to each backed-up directory pair,
    /// all relative to the working dir.
    fn expand_output_pairs(
        &self,
        files: &[(PathBuf, PathBuf)],
        dirs: &[(PathBuf, PathBuf)],
    ) -> std::io::Result<Vec<(PathBuf, PathBuf)>> {
        let wd = &self.layout.working_dir;
        let abs_dirs: Vec<(PathBuf, PathBuf)> =
            dirs.iter().map(|(l, r)| (wd.join(l), wd.join(r))).collect();
        let relative = |p: PathBuf| match p.strip_prefix(wd) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => p,
        };
        let mut pairs = files.to_vec();
        pairs.extend(
            expand_common_files_between_dirs(&abs_dirs)?
                .into_iter()
                .map(|(l, r)| (relative(l), relative(r))),
        );
        Ok(pairs)
    }

    /// Run the remote debug command in the remote environment.
    pub fn remote_debug(&self) -> SubprocessResult {
        let command = self.remote_debug_launch_command();
        msg(format!("Running remote debug command: {}", command_quoted_str(&command)));
        subprocess_call(&command, &self.call_options(false))
    }

    /// Lines describing how the local command differs from the remote one:
    /// `- token` for local-only tokens, `+ token` for remote-only ones.
    pub fn local_remote_command_differences(&self) -> Vec<String> {
        if !self.layout.commands_differ() {
            return Vec::new();
        }
        let local = &self.layout.local_only_command;
        let remote = &self.layout.remote_only_command;
        let prefix = local.iter().zip(remote).take_while(|(a, b)| a == b).count();
        let suffix = local[prefix..]
            .iter()
            .rev()
            .zip(remote[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        local[prefix..local.len() - suffix]
            .iter()
            .map(|t| format!("- {t}"))
            .chain(remote[prefix..remote.len() - suffix].iter().map(|t| format!("+ {t}")))
            .collect()
    }

    /// Print [`local_remote_command_differences`](Self::local_remote_command_differences)
    /// in verbose mode.
    pub fn show_local_remote_command_differences(&self) {
        let lines = self.local_remote_command_differences();
        if lines.is_empty() {
            return;
        }
        self.vmsg("Local command differs from the remote command:");
        for line in lines {
            self.vmsg(line);
        }
    }

    /// Remove generated scripts and lists.
    pub fn cleanup(&mut self) {
        for file in self.cleanup_files.drain(..) {
            if let Err(e) = fs::remove_file(&file)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                debug!(path = %file.display(), error = %e, "cleanup failed");
            }
        }
    }
}
