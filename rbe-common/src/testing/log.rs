//! JSONL logging for tests.
//!
//! Each [`TestLogger`] writes `target/test-logs/<test>.jsonl`; the global
//! subscriber from [`init_global_test_logging`] aggregates every tracing
//! event into `target/test-logs/all_tests.jsonl`. Subprocess results can be
//! recorded with their captured output, which is usually what matters when
//! a rewrapper scenario fails in CI.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     rbe_common::testing::init_global_test_logging();
//! }
//! ```

use crate::subprocess::SubprocessResult;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Teardown => "teardown",
        })
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install the JSONL file layer plus a compact test-writer layer.
///
/// `RBE_TEST_LOG_FILE` overrides the output path and `RBE_TEST_LOG_LEVEL`
/// the level (default `info`). Safe to call repeatedly.
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("RBE_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "rbe_common={level},remote_action={level},rbe_dl={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<File> {
    if let Ok(custom) = std::env::var("RBE_TEST_LOG_FILE") {
        let path = PathBuf::from(custom);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return File::create(path).ok();
    }
    let dir = test_log_dir();
    let _ = std::fs::create_dir_all(&dir);
    File::create(dir.join("all_tests.jsonl")).ok()
}

/// `$CARGO_TARGET_DIR/test-logs`, or the nearest `target/test-logs` above
/// the current directory.
fn test_log_dir() -> PathBuf {
    if let Ok(target) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target).join("test-logs");
    }
    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target.join("test-logs");
        }
        if !cwd.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    /// RFC 3339.
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestLogEntry {
    pub fn new(test_name: &str, phase: TestPhase, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: test_name.to_string(),
            phase,
            message: message.into(),
            data: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Per-test JSONL logger.
pub struct TestLogger {
    test_name: String,
    start_time: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
    log_file: Option<Mutex<File>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
        let dir = test_log_dir();
        let log_file = std::fs::create_dir_all(&dir)
            .and_then(|()| File::create(dir.join(format!("{safe_name}.jsonl"))))
            .ok();
        let logger = Self {
            test_name: test_name.to_string(),
            start_time: Instant::now(),
            entries: Mutex::new(Vec::new()),
            log_file: log_file.map(Mutex::new),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        let entry = TestLogEntry::new(&self.test_name, phase, message).with_duration(self.elapsed_ms());
        self.write_entry(entry);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        let entry = TestLogEntry::new(&self.test_name, phase, message)
            .with_duration(self.elapsed_ms())
            .with_data(data);
        self.write_entry(entry);
    }

    /// Record a finished subprocess with its exit code and captured output.
    pub fn log_result(&self, label: &str, result: &SubprocessResult) {
        self.log_with_data(
            TestPhase::Execute,
            label,
            serde_json::json!({
                "returncode": result.returncode,
                "pid": result.pid,
                "stdout": result.stdout,
                "stderr": result.stderr,
            }),
        );
    }

    fn write_entry(&self, entry: TestLogEntry) {
        if let Some(file) = &self.log_file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(f, "{json}");
        }
        tracing::info!(
            test = %self.test_name,
            phase = %entry.phase,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        );
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<TestLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// Logs TEST PASS on drop, or TEST FAIL when dropped by a panic.
///
/// Enabled by `RBE_TEST_LOGGING=1`, or by default under CI.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let enabled = match std::env::var("RBE_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        };
        Self {
            inner: enabled.then(|| {
                init_global_test_logging();
                TestLogger::for_test(test_name)
            }),
        }
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        if let Some(logger) = &self.inner {
            logger.log(phase, message);
        }
    }

    pub fn log_result(&self, label: &str, result: &SubprocessResult) {
        if let Some(logger) = &self.inner {
            logger.log_result(label, result);
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            if std::thread::panicking() {
                logger.log_with_data(
                    TestPhase::Verify,
                    "TEST FAIL",
                    serde_json::json!({ "reason": "test panicked" }),
                );
            } else {
                logger.log(TestPhase::Verify, "TEST PASS");
            }
        }
    }
}

/// A [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
