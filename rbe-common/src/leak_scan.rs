//! Detection of the local build directory leaking into remote actions.
//!
//! With a canonicalized remote working directory, any literal mention of
//! the real build subdirectory (e.g. `out/default`) in the command or the
//! output paths would make the remote action depend on where the build
//! lives, defeating cache sharing between output directories.

use crate::errors::ErrorCode;
use crate::logging::msg;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Matches a relative path at path-component boundaries.
#[derive(Debug, Clone)]
pub struct PathPattern {
    text: String,
    regex: Option<Regex>,
}

impl PathPattern {
    pub fn new(path: &Path) -> Self {
        let text = path.to_string_lossy().trim_end_matches('/').to_string();
        let pattern = format!(r"(^|[^A-Za-z0-9_.\-]){}($|[^A-Za-z0-9_.\-])", regex::escape(&text));
        let regex = Regex::new(&pattern).ok();
        Self { text, regex }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        !self.text.is_empty() && self.regex.as_ref().is_some_and(|r| r.is_match(haystack))
    }
}

/// A single place where the pattern was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leak {
    CommandToken { index: usize, token: String },
    OutputPath(PathBuf),
}

/// Find every leak in the command tokens and output paths.
pub fn find_leaks<S: AsRef<str>>(paths: &[PathBuf], command: &[S], pattern: &PathPattern) -> Vec<Leak> {
    let mut leaks: Vec<Leak> = command
        .iter()
        .enumerate()
        .filter(|(_, tok)| pattern.is_match(tok.as_ref()))
        .map(|(index, tok)| Leak::CommandToken {
            index,
            token: tok.as_ref().to_string(),
        })
        .collect();
    leaks.extend(
        paths
            .iter()
            .filter(|p| pattern.is_match(&p.to_string_lossy()))
            .map(|p| Leak::OutputPath(p.clone())),
    );
    leaks
}

/// Report leaks to the user. Returns 0 when clean, 1 otherwise.
pub fn preflight_checks<S: AsRef<str>>(paths: &[PathBuf], command: &[S], pattern: &PathPattern) -> i32 {
    let leaks = find_leaks(paths, command, pattern);
    for leak in &leaks {
        match leak {
            Leak::CommandToken { index, token } => msg(format!(
                "Error: command token [{index}] '{token}' references the build directory '{}'",
                pattern.text()
            )),
            Leak::OutputPath(p) => msg(format!(
                "Error: output path '{}' references the build directory '{}'",
                p.display(),
                pattern.text()
            )),
        }
    }
    if leaks.is_empty() {
        0
    } else {
        warn!(code = %ErrorCode::RemoteOutputDirLeak.code_string(), count = leaks.len(), "build directory leaks");
        1
    }
}
