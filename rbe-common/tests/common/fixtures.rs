use rbe_common::action::RemoteActionConfig;
use rbe_common::{Downloader, SubprocessResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// A project checkout with a build directory at `out/default`.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub exec_root: PathBuf,
    pub working_dir: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating test workspace");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let exec_root = dir.path().to_path_buf();
        let working_dir = exec_root.join("out/default");
        fs::create_dir_all(&working_dir).expect("Failed to create build dir");
        fs::create_dir_all(exec_root.join("build/rbe")).expect("Failed to create build/rbe");

        Self {
            dir,
            exec_root,
            working_dir,
        }
    }

    /// Write a file relative to the working directory.
    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.working_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, contents).expect("Failed to write file");
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.working_dir.join(rel)).expect("Failed to read file")
    }

    /// An executable shell script under `<exec_root>/bin`.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.exec_root.join("bin").join(name);
        fs::create_dir_all(path.parent().expect("script has a parent"))
            .expect("Failed to create bin dir");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write script");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .expect("Failed to make script executable");
        }
        path
    }

    /// A fake rewrapper that appends one line to `<name>.calls` per
    /// invocation, then runs `body`.
    pub fn fake_rewrapper(&self, name: &str, body: &str) -> (PathBuf, PathBuf) {
        let calls = self.exec_root.join(format!("{name}.calls"));
        let script = self.script(name, &format!("echo call >> '{}'\n{body}", calls.display()));
        (script, calls)
    }

    pub fn config(&self, rewrapper: &Path, command: &[&str]) -> RemoteActionConfig {
        RemoteActionConfig::new(
            rewrapper,
            command.iter().map(|s| s.to_string()).collect(),
            &self.exec_root,
            &self.working_dir,
        )
    }
}

/// Number of lines in a call-count file, zero if it does not exist.
pub fn call_count(calls: &Path) -> usize {
    fs::read_to_string(calls).map_or(0, |text| text.lines().count())
}

/// Serves blobs as files containing `contents`, counting fetches.
pub struct CountingDownloader {
    pub contents: String,
    pub delay: Duration,
    pub fail: bool,
    calls: AtomicUsize,
}

impl CountingDownloader {
    pub fn new(contents: &str) -> Self {
        Self {
            contents: contents.to_string(),
            delay: Duration::ZERO,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Downloader for CountingDownloader {
    fn download_blob(&self, path: &Path, _digest: &str, cwd: &Path) -> SubprocessResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.fail {
            return SubprocessResult {
                returncode: 1,
                stderr: vec!["blob not found".to_string()],
                ..SubprocessResult::default()
            };
        }
        let target = cwd.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).expect("Failed to create download parent");
        }
        fs::write(&target, &self.contents).expect("Failed to write download");
        SubprocessResult::with_code(0)
    }

    fn download_dir(&self, path: &Path, digest: &str, cwd: &Path) -> SubprocessResult {
        let dir = cwd.join(path);
        fs::create_dir_all(&dir).expect("Failed to create downloaded dir");
        self.download_blob(&dir.join("contents"), digest, cwd)
    }
}
