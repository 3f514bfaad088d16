//! Repeated local execution to catch non-reproducible outputs.
//!
//! The first run is the reference. Its outputs are copied aside under a
//! `.reference` suffix, the command is run again, and every output must
//! match its reference byte for byte. Runs are strictly sequential since
//! they all write the same paths.

use crate::compare::export_inputs;
use crate::errors::ErrorCode;
use crate::logging::msg;
use crate::subprocess::SubprocessResult;
use crate::util::{copy_preserve_subpath_from, files_match, with_appended_suffix};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const REFERENCE_SUFFIX: &str = ".reference";

/// Exit status for outputs that differ between repeated runs.
pub const DETERMINISM_MISMATCH_STATUS: i32 = 1;

/// Paths involved in a determinism check.
#[derive(Debug, Clone)]
pub struct DeterminismCheck {
    pub exec_root: PathBuf,
    pub working_dir: PathBuf,
    /// Output files, relative to the working dir.
    pub outputs: Vec<PathBuf>,
    /// Inputs relative to exec_root, exported alongside mismatching outputs.
    pub inputs: Vec<PathBuf>,
    /// Additional runs after the reference run.
    pub attempts: u32,
    pub export_dir: Option<PathBuf>,
}

impl DeterminismCheck {
    fn reference_of(&self, output: &Path) -> PathBuf {
        self.working_dir.join(with_appended_suffix(output, REFERENCE_SUFFIX))
    }

    fn snapshot(&self) -> io::Result<Vec<PathBuf>> {
        let mut kept = Vec::new();
        for out in &self.outputs {
            let abs = self.working_dir.join(out);
            if abs.is_file() {
                fs::copy(&abs, self.reference_of(out))?;
                kept.push(out.clone());
            }
        }
        Ok(kept)
    }

    fn mismatches(&self, snapshotted: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
        let mut differ = Vec::new();
        for out in snapshotted {
            let abs = self.working_dir.join(out);
            if !abs.is_file() || !files_match(&abs, &self.reference_of(out))? {
                differ.push(out.clone());
            }
        }
        Ok(differ)
    }

    fn export(&self, differ: &[PathBuf], export_dir: &Path) -> io::Result<()> {
        let build_subdir = self
            .working_dir
            .strip_prefix(&self.exec_root)
            .unwrap_or(Path::new(""))
            .to_path_buf();
        for out in differ {
            for variant in [out.clone(), with_appended_suffix(out, REFERENCE_SUFFIX)] {
                if self.working_dir.join(&variant).is_file() {
                    copy_preserve_subpath_from(&self.exec_root, &build_subdir.join(variant), export_dir)?;
                }
            }
        }
        export_inputs(&self.exec_root, &self.inputs, export_dir)
    }

    fn cleanup(&self, snapshotted: &[PathBuf]) {
        for out in snapshotted {
            let reference = self.reference_of(out);
            if let Err(e) = fs::remove_file(&reference)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %reference.display(), error = %e, "failed to remove reference output");
            }
        }
    }

    /// Run `run` once for reference and then `attempts` more times.
    ///
    /// Returns the first nonzero exit code from `run`, the mismatch status
    /// if any output changed, or 0.
    pub fn run<F>(&self, mut run: F) -> io::Result<i32>
    where
        F: FnMut() -> SubprocessResult,
    {
        let reference = run();
        if !reference.success() {
            return Ok(reference.returncode);
        }
        let snapshotted = self.snapshot()?;
        let outcome = self.check_attempts(&snapshotted, &mut run);

        let status = match outcome {
            Ok(Outcome::Reproduced) => {
                info!(attempts = self.attempts, "outputs reproduced");
                Ok(0)
            }
            Ok(Outcome::Failed { attempt, returncode }) => {
                msg(format!(
                    "Repeated local execution (attempt {attempt}) failed (exit={returncode})."
                ));
                Ok(returncode)
            }
            Ok(Outcome::Differ { attempt, outputs }) => self.report(attempt, &outputs),
            Err(e) => Err(e),
        };
        self.cleanup(&snapshotted);
        status
    }

    fn report(&self, attempt: u32, differ: &[PathBuf]) -> io::Result<i32> {
        warn!(
            code = %ErrorCode::DeterminismMismatch.code_string(),
            attempt,
            count = differ.len(),
            "non-deterministic outputs"
        );
        msg(format!(
            "Error: Repeated local execution (attempt {attempt}) produced different outputs:"
        ));
        for out in differ {
            println!("  {}", out.display());
        }
        if let Some(export_dir) = &self.export_dir {
            self.export(differ, export_dir)?;
            msg(format!(
                "Copied outputs and inputs to {} for inspection.",
                export_dir.display()
            ));
        }
        Ok(DETERMINISM_MISMATCH_STATUS)
    }

    fn check_attempts<F>(&self, snapshotted: &[PathBuf], run: &mut F) -> io::Result<Outcome>
    where
        F: FnMut() -> SubprocessResult,
    {
        for attempt in 1..=self.attempts {
            let rerun = run();
            if !rerun.success() {
                return Ok(Outcome::Failed {
                    attempt,
                    returncode: rerun.returncode,
                });
            }
            let outputs = self.mismatches(snapshotted)?;
            if !outputs.is_empty() {
                return Ok(Outcome::Differ { attempt, outputs });
            }
        }
        Ok(Outcome::Reproduced)
    }
}

enum Outcome {
    Reproduced,
    Failed { attempt: u32, returncode: i32 },
    Differ { attempt: u32, outputs: Vec<PathBuf> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn check(tmp: &TempDir, attempts: u32) -> DeterminismCheck {
        let working_dir = tmp.path().join("out/default");
        fs::create_dir_all(&working_dir).unwrap();
        DeterminismCheck {
            exec_root: tmp.path().to_path_buf(),
            working_dir,
            outputs: vec![PathBuf::from("a.o")],
            inputs: vec![],
            attempts,
            export_dir: None,
        }
    }

    #[test]
    fn test_stable_outputs_pass() {
        let tmp = TempDir::new().unwrap();
        let c = check(&tmp, 3);
        let runs = Cell::new(0);
        let status = c
            .run(|| {
                runs.set(runs.get() + 1);
                fs::write(c.working_dir.join("a.o"), "stable").unwrap();
                SubprocessResult::with_code(0)
            })
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(runs.get(), 4);
        assert!(!c.working_dir.join("a.o.reference").exists());
    }

    #[test]
    fn test_changing_outputs_fail_and_export() {
        let tmp = TempDir::new().unwrap();
        let mut c = check(&tmp, 2);
        c.export_dir = Some(tmp.path().join("export"));
        let runs = Cell::new(0);
        let status = c
            .run(|| {
                runs.set(runs.get() + 1);
                fs::write(c.working_dir.join("a.o"), format!("run {}", runs.get())).unwrap();
                SubprocessResult::with_code(0)
            })
            .unwrap();
        assert_eq!(status, DETERMINISM_MISMATCH_STATUS);
        assert_eq!(runs.get(), 2);
        let export = tmp.path().join("export/out/default");
        assert_eq!(fs::read_to_string(export.join("a.o")).unwrap(), "run 2");
        assert_eq!(fs::read_to_string(export.join("a.o.reference")).unwrap(), "run 1");
    }

    #[test]
    fn test_rerun_failure_returns_its_code() {
        let tmp = TempDir::new().unwrap();
        let c = check(&tmp, 2);
        let runs = Cell::new(0);
        let status = c
            .run(|| {
                runs.set(runs.get() + 1);
                SubprocessResult::with_code(if runs.get() == 1 { 0 } else { 5 })
            })
            .unwrap();
        assert_eq!(status, 5);
    }

    #[test]
    fn test_reference_failure_returns_its_code() {
        let tmp = TempDir::new().unwrap();
        let c = check(&tmp, 2);
        assert_eq!(c.run(|| SubprocessResult::with_code(3)).unwrap(), 3);
    }
}
