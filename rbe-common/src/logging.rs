//! Operator logging setup and user-facing messages.
//!
//! Two output channels exist. `tracing` events are operator logs routed to
//! stderr (text or JSON) and optionally a file. `msg()` prints the
//! `[remote-action] ...` lines that build users read on stdout.

use crate::config::EnvParser;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output encoding for operator logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" | "compact" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected text|json)")),
        }
    }
}

/// Logging configuration, usually read from `REMOTE_ACTION_LOG_*` variables.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

impl LogConfig {
    /// Read `REMOTE_ACTION_LOG_LEVEL`, `REMOTE_ACTION_LOG_FORMAT` and
    /// `REMOTE_ACTION_LOG_FILE`. Invalid values fall back to defaults.
    pub fn from_env(default_level: &str) -> Self {
        Self::from_parser(EnvParser::new("REMOTE_ACTION_"), default_level)
    }

    pub fn from_parser(mut parser: EnvParser, default_level: &str) -> Self {
        let level = parser.get_log_level("LOG_LEVEL", default_level).value;
        let format = parser
            .get_string("LOG_FORMAT", "text")
            .value
            .parse()
            .unwrap_or_default();
        let file = parser.get_optional_path("LOG_FILE", false).value;
        for err in parser.take_errors() {
            eprintln!("warning: {err}");
        }
        Self {
            level,
            format,
            file,
        }
    }

    /// Raise the level to `debug` when verbose output was requested.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        if verbose && matches!(self.level.as_str(), "info" | "warn" | "error" | "off") {
            self.level = "debug".to_string();
        }
        self
    }
}

/// Install the global subscriber.
///
/// Returns the appender guard when a log file is configured; dropping it
/// flushes pending lines, so keep it alive for the whole process.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_writer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)?;
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "remote-action.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let file_layer = file_writer.map(|w| {
        fmt::layer()
            .json()
            .with_writer(w)
            .with_target(true)
            .with_ansi(false)
    });

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}

static PROGRAM_NAME: OnceLock<String> = OnceLock::new();

/// Set the tag used by [`msg`]. Only the first call has an effect.
pub fn set_program_name(name: impl Into<String>) {
    let _ = PROGRAM_NAME.set(name.into());
}

fn program_name() -> &'static str {
    PROGRAM_NAME.get().map(String::as_str).unwrap_or("remote-action")
}

/// Format a user-facing line with the program tag.
pub fn format_msg(text: &str) -> String {
    format!("[{}] {}", program_name(), text)
}

/// Print a user-facing line to stdout.
pub fn msg(text: impl AsRef<str>) {
    println!("{}", format_msg(text.as_ref()));
}
