//! Command lines for remote, local and remote-debug execution.

use super::RemoteAction;
use crate::platform::platform_flag_value;
use crate::util::{auto_env_prefix_command, command_quoted_str};
use std::path::Path;

/// Trace every kind of file access.
const FSATRACE_OPTIONS: &str = "erwdtmq";
const FSATRACE_BUF_SIZE: &str = "FSAT_BUF_SIZE=5000000";

impl RemoteAction {
    /// rewrapper options: `--cfg`, `--exec_strategy`, the merged
    /// `--platform`, then everything else that was forwarded.
    pub fn rewrapper_option_flags(&self) -> Vec<String> {
        let mut options = Vec::new();
        if let Some(cfg) = &self.config.cfg {
            options.push("--cfg".to_string());
            options.push(cfg.display().to_string());
        }
        if let Some(strategy) = self.layout.exec_strategy {
            options.push(format!("--exec_strategy={strategy}"));
        }
        if let Some(platform) = &self.layout.merged_platform {
            options.push(format!("--platform={}", platform_flag_value(platform)));
        }
        options.extend(self.config.options.iter().cloned());
        options
    }

    /// rewrapper and its flags, up to but excluding `--`.
    pub fn rewrapper_command_prefix(&self) -> Vec<String> {
        let layout = &self.layout;
        let mut prefix = vec![
            self.config.rewrapper.display().to_string(),
            format!("--exec_root={}", layout.exec_root.display()),
        ];

        // The action log carries output digests, needed for stubs.
        if self.config.diagnose_nonzero || layout.rewrapper_options.skipping_some_download() {
            prefix.push(format!("--action_log={}", layout.action_log().display()));
        }

        prefix.extend(self.rewrapper_option_flags());

        if layout.needs_inputs_list {
            prefix.push(format!(
                "--input_list_paths={}",
                layout.inputs_list_file().display()
            ));
        }

        // outputs are relative to exec_root even though rewrapper runs in
        // the working dir
        if !layout.output_files.is_empty() {
            prefix.push(format!(
                "--output_files={}",
                join_paths(&layout.output_files_relative_to_exec_root())
            ));
        }
        if !layout.output_dirs.is_empty() {
            prefix.push(format!(
                "--output_directories={}",
                join_paths(&layout.output_dirs_relative_to_exec_root())
            ));
        }

        if !layout.local_only_flags.is_empty() {
            prefix.push(format!(
                "--local_wrapper=./{}",
                layout.local_wrapper_filename().display()
            ));
        }
        prefix
    }

    fn remote_command_prefix(&self) -> Vec<String> {
        let mut prefix = self.rewrapper_command_prefix();
        prefix.push("--".to_string());
        prefix
    }

    pub fn remote_log_command_prefix(&self) -> Vec<String> {
        match &self.layout.remote_log_name {
            Some(log) => vec![
                self.layout.remote_log_script_path().display().to_string(),
                "--log".to_string(),
                log.display().to_string(),
                "--".to_string(),
            ],
            None => Vec::new(),
        }
    }

    pub fn fsatrace_command_prefix(&self, log: &Path) -> Vec<String> {
        let Some(tracer) = &self.layout.fsatrace_path else {
            return Vec::new();
        };
        auto_env_prefix_command(vec![
            FSATRACE_BUF_SIZE.to_string(),
            tracer.display().to_string(),
            FSATRACE_OPTIONS.to_string(),
            log.display().to_string(),
            "--".to_string(),
        ])
    }

    /// rewrapper around the (optionally logged and traced) remote command.
    pub fn remote_launch_command(&self) -> Vec<String> {
        let mut command = self.remote_command_prefix();
        command.extend(self.remote_log_command_prefix());
        // fsatrace is the inner wrapper, so the trace does not include the
        // logging script's own accesses.
        command.extend(self.fsatrace_command_prefix(&self.layout.fsatrace_remote_trace()));
        command.extend(self.layout.remote_only_command());
        command
    }

    /// The local command, traced to a separate file when tracing.
    pub fn local_launch_command(&self) -> Vec<String> {
        let mut command = self.fsatrace_command_prefix(&self.layout.fsatrace_local_trace());
        command.extend(self.layout.local_only_command());
        command
    }

    /// Same remote setup, running a diagnostic command instead.
    pub fn remote_debug_launch_command(&self) -> Vec<String> {
        let mut command = self.remote_command_prefix();
        command.extend(self.config.remote_debug_command.iter().cloned());
        command
    }

    /// What [`RemoteAction::run`] will execute.
    pub fn launch_command(&self) -> Vec<String> {
        if self.config.disable {
            self.local_launch_command()
        } else {
            self.remote_launch_command()
        }
    }

    /// Shell script passed as `--local_wrapper`, re-adding local-only flags.
    pub fn local_wrapper_text(&self) -> String {
        let local_flags = command_quoted_str(&self.layout.local_only_flags);
        format!(
            "#!/bin/sh\nbase=\"$(basename $0)\"\ncmd=( \"$@\" {local_flags} )\nexec \"${{cmd[@]}}\"\n"
        )
    }
}

fn join_paths(paths: &[std::path::PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}
