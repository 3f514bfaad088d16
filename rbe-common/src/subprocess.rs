//! Blocking subprocess execution with captured output.
//!
//! Every command the orchestrator launches goes through [`subprocess_call`].
//! Output is captured line by line and, unless quiet, echoed as it arrives
//! so users see the wrapped tool's output in real time.

use crate::logging::msg;
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, warn};

/// Exit status used when the executable could not be started at all.
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Outcome of one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubprocessResult {
    pub returncode: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub pid: u32,
}

impl SubprocessResult {
    /// A result with no output and no process behind it.
    pub fn with_code(returncode: i32) -> Self {
        Self {
            returncode,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.returncode == 0
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    /// Print captured output when the command failed, and return the code.
    pub fn verbose_returncode(&self, label: &str) -> i32 {
        if self.returncode != 0 {
            msg(format!("{label} failed (exit={})", self.returncode));
            if !self.stdout.is_empty() {
                println!("stdout:\n{}", self.stdout_text());
            }
            if !self.stderr.is_empty() {
                println!("stderr:\n{}", self.stderr_text());
            }
        }
        self.returncode
    }
}

/// Options for [`subprocess_call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Capture without echoing.
    pub quiet: bool,
}

impl CallOptions {
    pub fn in_dir(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: Some(cwd.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        // Match the shell convention, so SIGKILL reads as 137.
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn pump<R, W>(reader: R, mut echo: Option<W>) -> Vec<String>
where
    R: io::Read,
    W: Write,
{
    let mut lines = Vec::new();
    for line in BufReader::new(reader).lines() {
        let Ok(line) = line else { break };
        if let Some(out) = echo.as_mut() {
            let _ = writeln!(out, "{line}");
        }
        lines.push(line);
    }
    lines
}

/// Run a command to completion, capturing its output.
pub fn try_subprocess_call<S: AsRef<str>>(
    command: &[S],
    options: &CallOptions,
) -> io::Result<SubprocessResult> {
    let Some((program, args)) = command.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    let mut cmd = Command::new(program.as_ref());
    cmd.args(args.iter().map(AsRef::as_ref))
        .envs(&options.env)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(pid, program = program.as_ref(), "spawned subprocess");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let quiet = options.quiet;

    let out_handle = stdout.map(|s| thread::spawn(move || pump(s, (!quiet).then(io::stdout))));
    let err_handle = stderr.map(|s| thread::spawn(move || pump(s, (!quiet).then(io::stderr))));

    let status = child.wait()?;
    let stdout = out_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stderr = err_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(SubprocessResult {
        returncode: exit_code(status),
        stdout,
        stderr,
        pid,
    })
}

/// Like [`try_subprocess_call`], but a command that cannot be started yields
/// exit status 127 with the error text in stderr.
pub fn subprocess_call<S: AsRef<str>>(command: &[S], options: &CallOptions) -> SubprocessResult {
    match try_subprocess_call(command, options) {
        Ok(result) => result,
        Err(e) => {
            let program = command.first().map(AsRef::as_ref).unwrap_or("");
            warn!(program, error = %e, "failed to launch command");
            let text = format!("{program}: {e}");
            if !options.quiet {
                eprintln!("{text}");
            }
            SubprocessResult {
                returncode: SPAWN_FAILURE_STATUS,
                stderr: vec![text],
                ..SubprocessResult::default()
            }
        }
    }
}
