//! Local vs. remote output comparison.
//!
//! Outputs are compared byte for byte first. Files that differ get a second
//! look through format-aware filters that erase expected differences
//! (absolute roots in linker maps, absolute paths in depfiles) before a
//! unified diff is produced for whatever remains.

use crate::depfile::rewrite_depfile;
use crate::logging::msg;
use crate::subprocess::{CallOptions, SubprocessResult, subprocess_call};
use crate::util::{
    copy_preserve_subpath_from, files_match, relpath, remove_path, transform_file_by_lines,
    with_appended_suffix,
};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix for remote copies kept aside during comparison.
pub const REMOTE_SUFFIX: &str = ".remote";
/// Suffix of filtered views written next to compared files.
pub const FILTERED_SUFFIX: &str = ".filtered";
/// Exec root on the remote workers.
pub const REMOTE_PROJECT_ROOT: &str = "/b/f/w";
/// Remote file-access trace suffix; traces are compared separately.
pub const REMOTE_FSATRACE_SUFFIX: &str = ".remote-fsatrace";
pub const LOCAL_FSATRACE_SUFFIX: &str = ".local-fsatrace";

/// Path layout needed to reconcile local and remote absolute paths.
#[derive(Debug, Clone)]
pub struct CompareLayout {
    pub exec_root: PathBuf,
    pub working_dir: PathBuf,
    pub build_subdir: PathBuf,
    pub remote_build_subdir: PathBuf,
}

impl CompareLayout {
    pub fn remote_exec_root(&self) -> PathBuf {
        PathBuf::from(REMOTE_PROJECT_ROOT)
    }

    pub fn remote_working_dir(&self) -> PathBuf {
        self.remote_exec_root().join(&self.remote_build_subdir)
    }

    /// Relative path from the working dir back up to the exec root.
    pub fn exec_root_rel(&self) -> PathBuf {
        relpath(&self.exec_root, &self.working_dir)
    }

    fn relativize_under(&self, path: &str, start: &Path) -> String {
        let p = Path::new(path);
        if p.is_absolute() {
            let rel = relpath(p, start).display().to_string();
            debug!(from = path, to = %rel, "relativized dep path");
            rel
        } else {
            path.to_string()
        }
    }

    /// Relativize an absolute path from a locally produced depfile.
    pub fn relativize_local_dep(&self, path: &str) -> String {
        self.relativize_under(path, &self.working_dir)
    }

    /// Relativize an absolute path from a remotely produced depfile.
    pub fn relativize_remote_dep(&self, path: &str) -> String {
        self.relativize_under(path, &self.remote_working_dir())
    }

    /// For depfiles of unknown origin: pick the root the path lives under.
    pub fn relativize_remote_or_local_dep(&self, path: &str) -> String {
        let p = Path::new(path);
        if !p.is_absolute() {
            return path.to_string();
        }
        if p.starts_with(&self.exec_root) {
            self.relativize_local_dep(path)
        } else if p.starts_with(self.remote_exec_root()) {
            self.relativize_remote_dep(path)
        } else {
            msg(format!("Unable to relativize path: {path}"));
            path.to_string()
        }
    }

    /// Normalize a local fsatrace line.
    pub fn local_fsatrace_transform(&self, line: &str) -> String {
        let root = format!("{}/", self.exec_root.display());
        line.replace(&root, "")
            .replace(&self.build_subdir.display().to_string(), "${build_subdir}")
    }

    /// Normalize a remote fsatrace line.
    pub fn remote_fsatrace_transform(&self, line: &str) -> String {
        let root = format!("{REMOTE_PROJECT_ROOT}/");
        line.replace(&root, "")
            .replace(&self.remote_build_subdir.display().to_string(), "${build_subdir}")
    }

    /// Write filtered views of a differing pair, if the format has a filter.
    /// Returns the filtered paths, or `None` to compare the originals.
    pub fn filter_pair(&self, local: &Path, remote: &Path) -> io::Result<Option<(PathBuf, PathBuf)>> {
        let local_filtered = with_appended_suffix(local, FILTERED_SUFFIX);
        let remote_filtered = with_appended_suffix(remote, FILTERED_SUFFIX);

        match local.extension().and_then(|e| e.to_str()) {
            Some("map") => {
                let exec_root = self.exec_root.display().to_string();
                let exec_root_rel = self.exec_root_rel().display().to_string();
                transform_file_by_lines(local, &local_filtered, |line| {
                    line.replace(&exec_root, &exec_root_rel)
                })?;
                transform_file_by_lines(remote, &remote_filtered, |line| {
                    line.replace(REMOTE_PROJECT_ROOT, &exec_root_rel)
                })?;
            }
            Some("d") => {
                rewrite_depfile(local, |p| self.relativize_local_dep(p), Some(&local_filtered))?;
                rewrite_depfile(remote, |p| self.relativize_remote_dep(p), Some(&remote_filtered))?;
            }
            _ => return Ok(None),
        }
        Ok(Some((local_filtered, remote_filtered)))
    }
}

/// `diff -u` of two files, captured.
pub fn text_diff(a: &Path, b: &Path) -> SubprocessResult {
    let cmd = [
        "diff".to_string(),
        "-u".to_string(),
        a.display().to_string(),
        b.display().to_string(),
    ];
    subprocess_call(&cmd, &CallOptions::default().quiet(true))
}

/// Files under `dir`, relative to it.
pub fn files_under_dir(dir: &Path) -> io::Result<BTreeSet<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<PathBuf>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.insert(rel.to_path_buf());
            }
        }
        Ok(())
    }
    let mut out = BTreeSet::new();
    walk(dir, dir, &mut out)?;
    Ok(out)
}

/// Expand directory pairs into pairs of their common files, sorted within
/// each pair.
pub fn expand_common_files_between_dirs(
    pairs: &[(PathBuf, PathBuf)],
) -> io::Result<Vec<(PathBuf, PathBuf)>> {
    let mut expanded = Vec::new();
    for (left, right) in pairs {
        let common: BTreeSet<PathBuf> = files_under_dir(left)?
            .intersection(&files_under_dir(right)?)
            .cloned()
            .collect();
        expanded.extend(common.into_iter().map(|f| (left.join(&f), right.join(&f))));
    }
    Ok(expanded)
}

/// A pair that still differs after filtering.
#[derive(Debug, Clone)]
pub struct Mismatch {
    /// Local output, relative to the working dir.
    pub local: PathBuf,
    /// Remote copy, relative to the working dir.
    pub remote: PathBuf,
    pub diff: SubprocessResult,
}

/// Outputs moved aside before the local re-run.
#[derive(Debug, Clone, Default)]
pub struct RemoteBackups {
    pub files: Vec<(PathBuf, PathBuf)>,
    pub dirs: Vec<(PathBuf, PathBuf)>,
}

/// Rename existing outputs to `<name>.remote` so a local run can recreate
/// them. Paths are relative to `working_dir`.
pub fn backup_remote_outputs(
    working_dir: &Path,
    output_files: &[PathBuf],
    output_dirs: &[PathBuf],
) -> io::Result<RemoteBackups> {
    let mut backups = RemoteBackups::default();
    for f in output_files {
        let abs = working_dir.join(f);
        if abs.is_file() && !f.to_string_lossy().ends_with(REMOTE_FSATRACE_SUFFIX) {
            let bkp = with_appended_suffix(f, REMOTE_SUFFIX);
            fs::rename(&abs, working_dir.join(&bkp))?;
            backups.files.push((f.clone(), bkp));
        }
    }
    for d in output_dirs {
        let abs = working_dir.join(d);
        if abs.is_dir() {
            let bkp = with_appended_suffix(d, REMOTE_SUFFIX);
            let bkp_abs = working_dir.join(&bkp);
            remove_path(&bkp_abs)?;
            fs::rename(&abs, bkp_abs)?;
            backups.dirs.push((d.clone(), bkp));
        }
    }
    Ok(backups)
}

/// Compare local/remote pairs (relative to `layout.working_dir`).
///
/// Identical remote copies are deleted. Returns the pairs that still differ
/// after filtering.
pub fn compare_output_pairs(
    layout: &CompareLayout,
    pairs: &[(PathBuf, PathBuf)],
) -> io::Result<Vec<Mismatch>> {
    let wd = &layout.working_dir;
    let mut candidates = Vec::new();
    for (local, remote) in pairs {
        if files_match(&wd.join(local), &wd.join(remote))? {
            fs::remove_file(wd.join(remote))?;
        } else {
            candidates.push((local.clone(), remote.clone()));
        }
    }

    let mut mismatches = Vec::new();
    for (local, remote) in candidates {
        let local_abs = wd.join(&local);
        let remote_abs = wd.join(&remote);
        let (a, b) = layout
            .filter_pair(&local_abs, &remote_abs)?
            .unwrap_or_else(|| (local_abs.clone(), remote_abs.clone()));
        if files_match(&a, &b)? {
            debug!(path = %local.display(), "outputs match after filtering");
            continue;
        }
        let diff = text_diff(&a, &b);
        mismatches.push(Mismatch { local, remote, diff });
    }
    Ok(mismatches)
}

/// Print a mismatch report.
pub fn report_mismatches(mismatches: &[Mismatch]) {
    if mismatches.is_empty() {
        return;
    }
    msg("*** Differences between local (-) and remote (+) build outputs found. ***");
    for m in mismatches {
        msg(format!("  {} vs. {}:", m.local.display(), m.remote.display()));
        for line in &m.diff.stdout {
            println!("{line}");
        }
        if m.diff.stdout.is_empty() && m.diff.stderr.is_empty() {
            println!(
                "diff tool exited {}, but did not report differences.",
                m.diff.returncode
            );
        }
        msg("------------------------------------");
    }
}

/// Copy differing outputs and the action's inputs into `export_dir`,
/// preserving their exec_root-relative sub-paths.
pub fn export_mismatches(
    layout: &CompareLayout,
    mismatches: &[Mismatch],
    inputs_from_exec_root: &[PathBuf],
    export_dir: &Path,
) -> io::Result<()> {
    for m in mismatches {
        for out in [&m.local, &m.remote] {
            copy_preserve_subpath_from(&layout.exec_root, &layout.build_subdir.join(out), export_dir)?;
        }
    }
    if !mismatches.is_empty() {
        export_inputs(&layout.exec_root, inputs_from_exec_root, export_dir)?;
    }
    Ok(())
}

/// Copy inputs (relative to `exec_root`) into `export_dir`. Missing inputs
/// are skipped.
pub fn export_inputs(exec_root: &Path, inputs: &[PathBuf], export_dir: &Path) -> io::Result<()> {
    for input in inputs {
        if exec_root.join(input).is_file() {
            copy_preserve_subpath_from(exec_root, input, export_dir)?;
        }
    }
    Ok(())
}

/// Normalize both traces and diff them.
pub fn compare_fsatraces(layout: &CompareLayout, local_trace: &Path, remote_trace: &Path) -> io::Result<SubprocessResult> {
    msg("Comparing local (-) vs. remote (+) file access traces.");
    let local_norm = with_appended_suffix(local_trace, ".norm");
    let remote_norm = with_appended_suffix(remote_trace, ".norm");
    transform_file_by_lines(local_trace, &local_norm, |l| layout.local_fsatrace_transform(l))?;
    transform_file_by_lines(remote_trace, &remote_norm, |l| layout.remote_fsatrace_transform(l))?;
    Ok(text_diff(&local_norm, &remote_norm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(root: &Path) -> CompareLayout {
        CompareLayout {
            exec_root: root.to_path_buf(),
            working_dir: root.join("out/default"),
            build_subdir: PathBuf::from("out/default"),
            remote_build_subdir: PathBuf::from("set_by_reclient/a"),
        }
    }

    #[test]
    fn test_remote_working_dir() {
        let l = layout(Path::new("/home/u/src"));
        assert_eq!(l.remote_working_dir(), PathBuf::from("/b/f/w/set_by_reclient/a"));
        assert_eq!(l.exec_root_rel(), PathBuf::from("../.."));
    }

    #[test]
    fn test_relativize_deps() {
        let l = layout(Path::new("/home/u/src"));
        assert_eq!(l.relativize_local_dep("/home/u/src/out/default/gen/a.h"), "gen/a.h");
        assert_eq!(l.relativize_remote_dep("/b/f/w/set_by_reclient/a/gen/a.h"), "gen/a.h");
        assert_eq!(l.relativize_local_dep("../../x.h"), "../../x.h");
        assert_eq!(l.relativize_remote_or_local_dep("/b/f/w/lib/x.h"), "../../lib/x.h");
        assert_eq!(l.relativize_remote_or_local_dep("/usr/include/x.h"), "/usr/include/x.h");
    }

    #[test]
    fn test_fsatrace_transforms_agree() {
        let l = layout(Path::new("/home/u/src"));
        assert_eq!(
            l.local_fsatrace_transform("r|/home/u/src/out/default/obj/a.o"),
            "r|${build_subdir}/obj/a.o"
        );
        assert_eq!(
            l.remote_fsatrace_transform("r|/b/f/w/set_by_reclient/a/obj/a.o"),
            "r|${build_subdir}/obj/a.o"
        );
    }

    #[test]
    fn test_files_under_dir_and_common() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        for d in [&a, &b] {
            fs::create_dir_all(d.join("sub")).unwrap();
            fs::write(d.join("sub/x"), "x").unwrap();
        }
        fs::write(a.join("only_a"), "").unwrap();
        let pairs = expand_common_files_between_dirs(&[(a.clone(), b.clone())]).unwrap();
        assert_eq!(pairs, [(a.join("sub/x"), b.join("sub/x"))]);
    }

    #[test]
    fn test_identical_outputs_compare_clean() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        fs::create_dir_all(&l.working_dir).unwrap();
        fs::write(l.working_dir.join("a.o"), "same").unwrap();
        fs::write(l.working_dir.join("a.o.remote"), "same").unwrap();

        let pairs = [(PathBuf::from("a.o"), PathBuf::from("a.o.remote"))];
        assert!(compare_output_pairs(&l, &pairs).unwrap().is_empty());
        assert!(!l.working_dir.join("a.o.remote").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_single_byte_difference_reported() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        fs::create_dir_all(&l.working_dir).unwrap();
        fs::write(l.working_dir.join("a.txt"), "hello\n").unwrap();
        fs::write(l.working_dir.join("a.txt.remote"), "hellp\n").unwrap();

        let pairs = [(PathBuf::from("a.txt"), PathBuf::from("a.txt.remote"))];
        let mismatches = compare_output_pairs(&l, &pairs).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_ne!(mismatches[0].diff.returncode, 0);
        assert!(l.working_dir.join("a.txt.remote").exists());
    }

    #[test]
    fn test_depfiles_equal_after_filtering() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        fs::create_dir_all(&l.working_dir).unwrap();
        fs::write(
            l.working_dir.join("a.d"),
            format!("a.o: {}/out/default/gen/a.h\n", tmp.path().display()),
        )
        .unwrap();
        fs::write(
            l.working_dir.join("a.d.remote"),
            "a.o: /b/f/w/set_by_reclient/a/gen/a.h\n",
        )
        .unwrap();

        let pairs = [(PathBuf::from("a.d"), PathBuf::from("a.d.remote"))];
        assert!(compare_output_pairs(&l, &pairs).unwrap().is_empty());
    }

    #[test]
    fn test_map_files_equal_after_filtering() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        fs::create_dir_all(&l.working_dir).unwrap();
        fs::write(
            l.working_dir.join("x.map"),
            format!("{}/src/a.c\n", tmp.path().display()),
        )
        .unwrap();
        fs::write(l.working_dir.join("x.map.remote"), "/b/f/w/src/a.c\n").unwrap();

        let pairs = [(PathBuf::from("x.map"), PathBuf::from("x.map.remote"))];
        assert!(compare_output_pairs(&l, &pairs).unwrap().is_empty());
    }

    #[test]
    fn test_backup_remote_outputs() {
        let tmp = TempDir::new().unwrap();
        let wd = tmp.path();
        fs::write(wd.join("a.o"), "a").unwrap();
        fs::write(wd.join("t.remote-fsatrace"), "").unwrap();
        fs::create_dir_all(wd.join("gen")).unwrap();

        let backups = backup_remote_outputs(
            wd,
            &[
                PathBuf::from("a.o"),
                PathBuf::from("t.remote-fsatrace"),
                PathBuf::from("missing.o"),
            ],
            &[PathBuf::from("gen")],
        )
        .unwrap();
        assert_eq!(backups.files, [(PathBuf::from("a.o"), PathBuf::from("a.o.remote"))]);
        assert_eq!(backups.dirs, [(PathBuf::from("gen"), PathBuf::from("gen.remote"))]);
        assert!(wd.join("a.o.remote").is_file());
        assert!(wd.join("t.remote-fsatrace").is_file());
        assert!(wd.join("gen.remote").is_dir());
    }

    #[test]
    fn test_export_mismatches() {
        let tmp = TempDir::new().unwrap();
        let l = layout(tmp.path());
        fs::create_dir_all(&l.working_dir).unwrap();
        fs::write(l.working_dir.join("a.o"), "1").unwrap();
        fs::write(l.working_dir.join("a.o.remote"), "2").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(tmp.path().join("src/a.c"), "int a;").unwrap();

        let export = tmp.path().join("export");
        let mismatch = Mismatch {
            local: PathBuf::from("a.o"),
            remote: PathBuf::from("a.o.remote"),
            diff: SubprocessResult::with_code(1),
        };
        export_mismatches(&l, &[mismatch], &[PathBuf::from("src/a.c")], &export).unwrap();
        assert!(export.join("out/default/a.o").is_file());
        assert!(export.join("out/default/a.o.remote").is_file());
        assert!(export.join("src/a.c").is_file());
    }
}
