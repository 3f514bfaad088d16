//! Reading rewrapper `--action_log` records.

use crate::stub::{DownloadStubInfo, StubType};
use crate::textproto::{self, TextMessage, TextProtoError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Completion statuses for actions that did not run remotely; their
/// outputs were produced locally and need no download stubs.
pub const LOCAL_COMPLETION_STATUSES: &[&str] = &[
    "STATUS_LOCAL_EXECUTION",
    "STATUS_LOCAL_FALLBACK",
    "STATUS_RACING_LOCAL",
];

#[derive(Debug, Error)]
pub enum ActionLogError {
    #[error("failed to read action log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse action log {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: TextProtoError,
    },
}

/// One reproxy `LogRecord`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReproxyLogEntry {
    pub execution_id: String,
    pub action_digest: String,
    pub completion_status: String,
    /// Output path (relative to the working dir) to `hash/size`.
    pub output_file_digests: BTreeMap<PathBuf, String>,
    pub output_directory_digests: BTreeMap<PathBuf, String>,
}

impl ReproxyLogEntry {
    pub fn parse_action_log(log: &Path) -> Result<Self, ActionLogError> {
        let text = std::fs::read_to_string(log).map_err(|source| ActionLogError::Io {
            path: log.to_path_buf(),
            source,
        })?;
        Self::parse_text(&text).map_err(|source| ActionLogError::Parse {
            path: log.to_path_buf(),
            source,
        })
    }

    pub fn parse_text(text: &str) -> Result<Self, TextProtoError> {
        Ok(Self::from_message(&textproto::parse(text)?))
    }

    /// Absent fields read as empty.
    pub fn from_message(record: &TextMessage) -> Self {
        let execution_id = record
            .message("command")
            .and_then(|c| c.message("identifiers"))
            .and_then(|i| i.scalar("execution_id"))
            .unwrap_or_default()
            .to_string();
        let metadata = record.message("remote_metadata");
        let action_digest = metadata
            .and_then(|m| m.scalar("action_digest"))
            .unwrap_or_default()
            .to_string();
        let digests = |field: &str| -> BTreeMap<PathBuf, String> {
            metadata
                .map(|m| m.scalar_map(field))
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (PathBuf::from(k), v))
                .collect()
        };

        Self {
            execution_id,
            action_digest,
            completion_status: record
                .scalar("completion_status")
                .unwrap_or_default()
                .to_string(),
            output_file_digests: digests("output_file_digests"),
            output_directory_digests: digests("output_directory_digests"),
        }
    }

    pub fn completed_locally(&self) -> bool {
        LOCAL_COMPLETION_STATUSES.contains(&self.completion_status.as_str())
    }

    /// Stub info for an output, or `None` if the action did not produce it.
    /// Outputs are optional for reclient, so a missing one is not an error.
    pub fn make_download_stub_info(&self, path: &Path, build_id: &str) -> Option<DownloadStubInfo> {
        let (kind, digest) = if let Some(d) = self.output_file_digests.get(path) {
            (StubType::File, d)
        } else if let Some(d) = self.output_directory_digests.get(path) {
            (StubType::Dir, d)
        } else {
            return None;
        };
        Some(DownloadStubInfo::new(
            path,
            kind,
            digest.clone(),
            self.action_digest.clone(),
            build_id,
        ))
    }

    pub fn make_download_stubs(
        &self,
        files: &[PathBuf],
        dirs: &[PathBuf],
        build_id: &str,
    ) -> BTreeMap<PathBuf, DownloadStubInfo> {
        files
            .iter()
            .chain(dirs)
            .filter_map(|p| Some((p.clone(), self.make_download_stub_info(p, build_id)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"
command: {
  identifiers: {
    execution_id: "e-1"
  }
}
remote_metadata: {
  action_digest: "ad/10"
  output_file_digests: { key: "obj/a.o" value: "f1/5" }
  output_directory_digests: { key: "gen" value: "d1/77" }
}
completion_status: STATUS_CACHE_HIT
"#;

    #[test]
    fn test_parse_record() {
        let entry = ReproxyLogEntry::parse_text(RECORD).unwrap();
        assert_eq!(entry.execution_id, "e-1");
        assert_eq!(entry.action_digest, "ad/10");
        assert_eq!(entry.completion_status, "STATUS_CACHE_HIT");
        assert!(!entry.completed_locally());
        assert_eq!(entry.output_file_digests[Path::new("obj/a.o")], "f1/5");
    }

    #[test]
    fn test_make_download_stubs_skips_missing_outputs() {
        let entry = ReproxyLogEntry::parse_text(RECORD).unwrap();
        let stubs = entry.make_download_stubs(
            &[PathBuf::from("obj/a.o"), PathBuf::from("crash.log")],
            &[PathBuf::from("gen")],
            "build-7",
        );
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[Path::new("gen")].kind, StubType::Dir);
        let file = &stubs[Path::new("obj/a.o")];
        assert_eq!(file.blob_digest, "f1/5");
        assert_eq!(file.action_digest, "ad/10");
        assert_eq!(file.build_id, "build-7");
    }

    #[test]
    fn test_local_status() {
        let entry = ReproxyLogEntry::parse_text("completion_status: STATUS_LOCAL_FALLBACK").unwrap();
        assert!(entry.completed_locally());
        assert!(entry.execution_id.is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            ReproxyLogEntry::parse_action_log(Path::new("/nonexistent/x.rrpl")),
            Err(ActionLogError::Io { .. })
        ));
    }
}
