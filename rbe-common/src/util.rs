//! Shared path, command and file helpers.

use std::borrow::Cow;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Quote a command for display so it can be pasted into a shell.
pub fn command_quoted_str<S: AsRef<str>>(command: &[S]) -> String {
    command
        .iter()
        .map(|tok| shell_escape::unix::escape(Cow::Borrowed(tok.as_ref())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Prefix with `env` when the command starts with `VAR=value` tokens, so it
/// can be executed directly without a shell.
pub fn auto_env_prefix_command(command: Vec<String>) -> Vec<String> {
    match command.first() {
        Some(first) if is_env_assignment(first) => {
            let mut prefixed = Vec::with_capacity(command.len() + 1);
            prefixed.push("env".to_string());
            prefixed.extend(command);
            prefixed
        }
        _ => command,
    }
}

/// Lexically normalize a path: drop `.` components and fold `..` where
/// possible. Does not touch the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Relative path from `start` to `path`, like `os.path.relpath`.
///
/// Both paths should be absolute (or both relative to the same base).
/// Returns `.` when they are the same location.
pub fn relpath(path: &Path, start: &Path) -> PathBuf {
    let path = normalize_path(path);
    let start = normalize_path(start);
    let path_comps: Vec<_> = path.components().collect();
    let start_comps: Vec<_> = start.components().collect();

    let common = path_comps
        .iter()
        .zip(start_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..start_comps.len() {
        rel.push("..");
    }
    for comp in &path_comps[common..] {
        rel.push(comp.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        rel
    }
}

/// Split a sequence at the first occurrence of `sep`.
///
/// Returns (before, separator-if-found, after). When the separator is
/// absent, everything is in `before`.
pub fn partition_sequence<'a, T: PartialEq>(
    seq: &'a [T],
    sep: &T,
) -> (&'a [T], Option<&'a T>, &'a [T]) {
    match seq.iter().position(|x| x == sep) {
        Some(i) => (&seq[..i], Some(&seq[i]), &seq[i + 1..]),
        None => (seq, None, &[]),
    }
}

/// Flatten repeated comma-separated flag values into one list, skipping
/// empty elements.
pub fn flatten_comma_list<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .flat_map(|v| {
            v.as_ref()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Parse a boolean the way Go's `flag` package does.
pub fn bool_golang_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Write lines with a trailing newline, creating parent directories.
pub fn write_lines<I, S>(path: &Path, lines: I) -> io::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut contents = lines
        .into_iter()
        .map(|l| l.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    contents.push('\n');
    fs::write(path, contents)
}

/// Apply `transform` to every line of `src` and write the result to `dest`.
pub fn transform_file_by_lines<F>(src: &Path, dest: &Path, transform: F) -> io::Result<()>
where
    F: Fn(&str) -> String,
{
    let text = fs::read_to_string(src)?;
    let lines: Vec<String> = text.lines().map(&transform).collect();
    write_lines(dest, lines)
}

/// Read non-empty lines from each list file as paths.
pub fn expand_paths_from_files(files: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for file in files {
        let text = fs::read_to_string(file)?;
        paths.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from),
        );
    }
    Ok(paths)
}

/// Byte-for-byte comparison. Files of different size never match.
pub fn files_match(a: &Path, b: &Path) -> io::Result<bool> {
    let meta_a = fs::metadata(a)?;
    let meta_b = fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut fa = io::BufReader::new(fs::File::open(a)?);
    let mut fb = io::BufReader::new(fs::File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n = fa.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        fb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Copy `path` (relative to the current directory) to `dest_dir/path`.
pub fn copy_preserve_subpath(path: &Path, dest_dir: &Path) -> io::Result<()> {
    copy_preserve_subpath_from(Path::new("."), path, dest_dir)
}

/// Copy `base/path` to `dest_dir/path`, creating directories as needed.
///
/// Absolute paths and paths that climb out of `base` are refused since
/// they cannot be mirrored under the destination.
pub fn copy_preserve_subpath_from(base: &Path, path: &Path, dest_dir: &Path) -> io::Result<()> {
    let normalized = normalize_path(path);
    if normalized.is_absolute()
        || normalized
            .components()
            .next()
            .is_some_and(|c| c == Component::ParentDir)
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot preserve sub-path of {}", path.display()),
        ));
    }
    let dest = dest_dir.join(&normalized);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(base.join(&normalized), dest)?;
    Ok(())
}

/// Remove a file or an entire directory tree; missing paths are fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Append a suffix to the full file name (`a.o` + `.remote` = `a.o.remote`).
pub fn with_appended_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
