//! Best-effort explanations for failed remote actions.
//!
//! Looks through the per-invocation rewrapper logs, the action's own
//! execution record and reproxy's error log for known failure signatures.
//! Nothing here affects the exit code: missing or unreadable logs simply
//! end the analysis early.

use crate::config::RbeEnvironment;
use crate::errors::ErrorCode;
use crate::logging::msg;
use crate::reproxy_log::ReproxyLogEntry;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Stable symlink to the current reproxy error log.
pub const REPROXY_ERROR_LOG: &str = "reproxy.ERROR";

fn missing_file_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Status:LocalErrorResultStatus.*Err:stat ([^:]+): no such file or directory").ok()
    })
    .as_ref()
}

/// A recognized failure signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    FailToDial { line: String },
    PermissionDenied { line: String },
    MissingInput {
        line: String,
        path: String,
        generated: bool,
    },
}

impl Finding {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FailToDial { .. } => ErrorCode::RemoteFailToDial,
            Self::PermissionDenied { .. } => ErrorCode::RemotePermissionDenied,
            Self::MissingInput { .. } => ErrorCode::RemoteMissingInput,
        }
    }

    /// The log line that triggered the finding.
    pub fn line(&self) -> &str {
        match self {
            Self::FailToDial { line }
            | Self::PermissionDenied { line }
            | Self::MissingInput { line, .. } => line,
        }
    }

    pub fn report(&self) {
        println!("{}", self.line());
        if let Self::MissingInput { path, generated, .. } = self {
            let description = if *generated { "generated file" } else { "source" };
            msg(format!(
                "Possibly missing a local input file for uploading: {path} ({description})"
            ));
        }
        msg(self.code().entry().format_full());
    }
}

/// Check one reproxy error line against every known signature.
pub fn diagnose_reproxy_error_line(line: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    if line.contains("Fail to dial") {
        findings.push(Finding::FailToDial {
            line: line.to_string(),
        });
    }
    if line.contains(
        "Error connecting to remote execution client: rpc error: code = PermissionDenied",
    ) {
        findings.push(Finding::PermissionDenied {
            line: line.to_string(),
        });
    }
    if let Some(caps) = missing_file_re().and_then(|re| re.captures(line)) {
        let path = caps[1].to_string();
        findings.push(Finding::MissingInput {
            line: line.to_string(),
            generated: path.starts_with("out/"),
            path,
        });
    }
    findings
}

/// Rewrapper logs for a process: `rewrapper.{host}.{user}.log.{severity}.{stamp}.{pid}`.
pub fn rewrapper_logs_for_pid(log_dir: &Path, pid: u32) -> Vec<PathBuf> {
    let suffix = format!(".{pid}");
    let Ok(entries) = fs::read_dir(log_dir) else {
        return Vec::new();
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("rewrapper.") && name.ends_with(&suffix)
        })
        .map(|e| e.path())
        .collect();
    logs.sort();
    logs
}

/// Findings from lines of `error_log` that mention `execution_id`.
pub fn scan_reproxy_errors(error_log: &Path, execution_id: &str) -> Vec<Finding> {
    let Ok(text) = fs::read_to_string(error_log) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| line.contains(execution_id))
        .flat_map(diagnose_reproxy_error_line)
        .collect()
}

/// Try to explain a failed rewrapper invocation, printing what is found.
///
/// Gives up quietly unless both reproxy and rewrapper log directories are
/// known.
pub fn analyze_rbe_logs(env: &RbeEnvironment, rewrapper_pid: u32, action_log: Option<&Path>) -> Vec<Finding> {
    let (Some(reproxy_dir), Some(rewrapper_dir)) = (env.proxy_log_dir(), env.rewrapper_log_dir()) else {
        debug!("log directories unknown, skipping diagnostics");
        return Vec::new();
    };

    let logs = rewrapper_logs_for_pid(rewrapper_dir, rewrapper_pid);
    if !logs.is_empty() {
        msg("See rewrapper logs:");
        for log in &logs {
            println!("  {}", log.display());
        }
        println!();
    }

    let Some(action_log) = action_log.filter(|p| p.is_file()) else {
        return Vec::new();
    };
    msg(format!("Action log: {}", action_log.display()));
    let record = match ReproxyLogEntry::parse_action_log(action_log) {
        Ok(record) => record,
        Err(e) => {
            debug!(error = %e, "unreadable action log, skipping diagnostics");
            return Vec::new();
        }
    };
    println!("  execution_id: {}", record.execution_id);
    println!("  action_digest: {}", record.action_digest);
    println!();

    let reproxy_errors = reproxy_dir.join(REPROXY_ERROR_LOG);
    if !reproxy_errors.is_file() || record.execution_id.is_empty() {
        return Vec::new();
    }
    msg(format!("Scanning {} for clues:", reproxy_errors.display()));
    let findings = scan_reproxy_errors(&reproxy_errors, &record.execution_id);
    for finding in &findings {
        finding.report();
    }
    findings
}
