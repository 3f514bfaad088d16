//! Download stubs: placeholders for artifacts that stayed in the CAS.
//!
//! A stub is a small text file:
//!
//! ```text
//! # RBE download stub
//! # run //build/rbe/dlwrap.py on this file to download
//! path=obj/foo.o
//! type=file
//! blob_digest=<sha256>/<size>
//! action_digest=<sha256>/<size>
//! build_id=<id>
//! ```
//!
//! Where extended attributes are supported, the stub file is also tagged
//! with the blob digest, which tells the next reproxy invocation that the
//! blob already exists remotely. Materializing a stub moves it aside to
//! `<path>.dl-stub` so the download can be undone.

use crate::digest::{BlobDigest, DigestError};
use crate::remotetool::Downloader;
use crate::subprocess::SubprocessResult;
use crate::util::{remove_path, with_appended_suffix, write_lines};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

pub const STUB_IDENTIFIER: &str = "# RBE download stub";
pub const STUB_HELP: &str = "# run //build/rbe/dlwrap.py on this file to download";
pub const STUB_BACKUP_SUFFIX: &str = ".dl-stub";
pub const DOWNLOAD_TEMP_SUFFIX: &str = ".download-tmp";
/// Must match the `xattr_digest` setting in the reproxy config.
pub const STUB_XATTR_NAME: &str = "user.fuchsia.rbe.digest.sha256";

#[derive(Debug, Error)]
pub enum StubError {
    #[error("{path} is not a download stub")]
    NotAStub { path: PathBuf },

    #[error("download stub {path} is missing field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    #[error("download stub {path} has invalid type '{value}'")]
    InvalidType { path: PathBuf, value: String },

    #[error("download stub {path} has invalid blob digest: {source}")]
    InvalidDigest {
        path: PathBuf,
        #[source]
        source: DigestError,
    },

    #[error("I/O error on download stub {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StubError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Whether a stub stands for a file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubType {
    File,
    Dir,
}

impl fmt::Display for StubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Dir => "dir",
        })
    }
}

impl FromStr for StubType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            other => Err(other.to_string()),
        }
    }
}

/// Where a stub is kept once its artifact has been downloaded.
pub fn download_stub_backup_location(path: &Path) -> PathBuf {
    with_appended_suffix(path, STUB_BACKUP_SUFFIX)
}

/// Where an artifact is fetched before being moved into place.
pub fn download_temp_location(dest: &Path) -> PathBuf {
    with_appended_suffix(dest, DOWNLOAD_TEMP_SUFFIX)
}

/// Metadata of a remotely stored artifact.
#[derive(Debug, Clone)]
pub struct DownloadStubInfo {
    /// Path relative to the working directory.
    pub path: PathBuf,
    pub kind: StubType,
    /// `hash/size` of the blob (or directory tree root).
    pub blob_digest: String,
    pub action_digest: String,
    pub build_id: String,
}

/// `action_digest` is excluded: different actions can produce the same blob.
impl PartialEq for DownloadStubInfo {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.kind == other.kind
            && self.blob_digest == other.blob_digest
            && self.build_id == other.build_id
    }
}

impl Eq for DownloadStubInfo {}

impl DownloadStubInfo {
    pub fn new(
        path: impl Into<PathBuf>,
        kind: StubType,
        blob_digest: impl Into<String>,
        action_digest: impl Into<String>,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            blob_digest: blob_digest.into(),
            action_digest: action_digest.into(),
            build_id: build_id.into(),
        }
    }

    /// Stub file lines, without trailing newlines.
    pub fn to_lines(&self) -> Vec<String> {
        vec![
            STUB_IDENTIFIER.to_string(),
            STUB_HELP.to_string(),
            format!("path={}", self.path.display()),
            format!("type={}", self.kind),
            format!("blob_digest={}", self.blob_digest),
            format!("action_digest={}", self.action_digest),
            format!("build_id={}", self.build_id),
        ]
    }

    /// Write the stub to `working_dir_abs/(dest or path)`, replacing whatever
    /// is there.
    pub fn create(&self, working_dir_abs: &Path, dest: Option<&Path>) -> Result<(), StubError> {
        let target = working_dir_abs.join(dest.unwrap_or(&self.path));
        if target.is_dir() {
            fs::remove_dir_all(&target).map_err(|e| StubError::io(&target, e))?;
        }
        write_lines(&target, self.to_lines()).map_err(|e| StubError::io(&target, e))?;
        set_digest_xattr(&target, &self.blob_digest);
        debug!(path = %target.display(), digest = %self.blob_digest, "wrote download stub");
        Ok(())
    }

    /// Parse a stub file.
    pub fn read_from_file(stub: &Path) -> Result<Self, StubError> {
        let text = fs::read_to_string(stub).map_err(|e| StubError::io(stub, e))?;
        Self::parse(stub, &text)
    }

    fn parse(stub: &Path, text: &str) -> Result<Self, StubError> {
        let mut lines = text.lines();
        if lines.next().map(str::trim_end) != Some(STUB_IDENTIFIER) {
            return Err(StubError::NotAStub {
                path: stub.to_path_buf(),
            });
        }

        let mut path = None;
        let mut kind = None;
        let mut blob_digest = None;
        let mut action_digest = None;
        let mut build_id = None;
        for line in lines {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim_end().to_string();
            match key {
                "path" => path = Some(value),
                "type" => kind = Some(value),
                "blob_digest" => blob_digest = Some(value),
                "action_digest" => action_digest = Some(value),
                "build_id" => build_id = Some(value),
                _ => {}
            }
        }

        let missing = |field| StubError::MissingField {
            path: stub.to_path_buf(),
            field,
        };
        let kind_text = kind.ok_or_else(|| missing("type"))?;
        let kind = kind_text.parse::<StubType>().map_err(|value| StubError::InvalidType {
            path: stub.to_path_buf(),
            value,
        })?;
        let blob_digest = blob_digest.ok_or_else(|| missing("blob_digest"))?;
        BlobDigest::from_str(&blob_digest).map_err(|source| StubError::InvalidDigest {
            path: stub.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: PathBuf::from(path.ok_or_else(|| missing("path"))?),
            kind,
            blob_digest,
            action_digest: action_digest.ok_or_else(|| missing("action_digest"))?,
            build_id: build_id.ok_or_else(|| missing("build_id"))?,
        })
    }

    /// Fetch the artifact into `working_dir_abs/(dest or path)`.
    ///
    /// The blob lands in a temporary sibling first. On success the old
    /// file's mode is applied to it, an existing stub is moved to its backup
    /// location, and the fetched artifact is renamed into place.
    ///
    /// No locking happens here; use [`crate::download::download_from_stub_path`]
    /// when other processes may fetch the same path.
    pub fn download(
        &self,
        downloader: &dyn Downloader,
        working_dir_abs: &Path,
        dest: Option<&Path>,
    ) -> SubprocessResult {
        let dest_abs = working_dir_abs.join(dest.unwrap_or(&self.path));
        let temp_dl = download_temp_location(&dest_abs);

        let status = match self.kind {
            StubType::File => downloader.download_blob(&temp_dl, &self.blob_digest, working_dir_abs),
            StubType::Dir => downloader.download_dir(&temp_dl, &self.blob_digest, working_dir_abs),
        };
        if !status.success() {
            warn!(path = %dest_abs.display(), code = status.returncode, "download failed");
            return status;
        }

        match finish_download(&temp_dl, &dest_abs) {
            Ok(()) => status,
            Err(e) => {
                warn!(path = %dest_abs.display(), error = %e, "failed to move download into place");
                if let Err(e) = remove_path(&temp_dl) {
                    warn!(path = %temp_dl.display(), error = %e, "failed to remove partial download");
                }
                SubprocessResult {
                    returncode: 1,
                    stderr: vec![format!("{}: {e}", dest_abs.display())],
                    ..status
                }
            }
        }
    }
}

fn finish_download(temp_dl: &Path, dest_abs: &Path) -> io::Result<()> {
    if let Ok(meta) = fs::metadata(dest_abs)
        && meta.is_file()
        && temp_dl.is_file()
    {
        fs::set_permissions(temp_dl, meta.permissions())?;
    }
    if dest_abs.exists() && is_download_stub_file(dest_abs) {
        // rename keeps the xattr on the backup
        fs::rename(dest_abs, download_stub_backup_location(dest_abs))?;
    } else if let Some(parent) = dest_abs.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest_abs.is_dir() {
        fs::remove_dir_all(dest_abs)?;
    }
    fs::rename(temp_dl, dest_abs)
}

#[cfg(unix)]
fn set_digest_xattr(path: &Path, digest: &str) {
    if !xattr::SUPPORTED_PLATFORM {
        return;
    }
    if let Err(e) = xattr::set(path, STUB_XATTR_NAME, digest.as_bytes()) {
        // Not every filesystem accepts user attributes; content sniffing
        // still identifies the stub.
        debug!(path = %path.display(), error = %e, "could not tag stub with xattr");
    }
}

#[cfg(not(unix))]
fn set_digest_xattr(_path: &Path, _digest: &str) {}

#[cfg(unix)]
fn has_digest_xattr(path: &Path) -> bool {
    xattr::SUPPORTED_PLATFORM && matches!(xattr::get(path, STUB_XATTR_NAME), Ok(Some(_)))
}

#[cfg(not(unix))]
fn has_digest_xattr(_path: &Path) -> bool {
    false
}

/// The digest recorded in the stub xattr, if any.
#[cfg(unix)]
pub fn xattr_digest(path: &Path) -> Option<String> {
    if !xattr::SUPPORTED_PLATFORM {
        return None;
    }
    xattr::get(path, STUB_XATTR_NAME)
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
}

#[cfg(not(unix))]
pub fn xattr_digest(_path: &Path) -> Option<String> {
    None
}

fn file_starts_with(path: &Path, text: &str) -> bool {
    let Ok(file) = fs::File::open(path) else {
        return false;
    };
    let mut head = Vec::with_capacity(text.len());
    match file.take(text.len() as u64).read_to_end(&mut head) {
        Ok(_) => head == text.as_bytes(),
        Err(_) => false,
    }
}

/// True if `path` is a download stub.
///
/// The digest xattr is authoritative when present. Otherwise the first
/// line of the file is compared to the stub identifier.
pub fn is_download_stub_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    has_digest_xattr(path) || file_starts_with(path, STUB_IDENTIFIER)
}

/// Restore `<path>.dl-stub` over `path`. Returns true if a stub was restored.
pub fn undownload(path: &Path) -> io::Result<bool> {
    let backup = download_stub_backup_location(path);
    if backup.exists() && is_download_stub_file(&backup) {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        }
        fs::rename(&backup, path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Read `path` as a stub. Ordinary files give `Ok(None)`.
pub fn path_to_download_stub(path: &Path) -> Result<Option<DownloadStubInfo>, StubError> {
    if !is_download_stub_file(path) {
        return Ok(None);
    }
    DownloadStubInfo::read_from_file(path).map(Some)
}

/// Fetch a file by digest without a stub on disk, e.g. an output of a
/// failed action.
pub fn download_file_to_path(
    downloader: &dyn Downloader,
    working_dir_abs: &Path,
    path: &Path,
    blob_digest: &str,
    action_digest: Option<&str>,
) -> SubprocessResult {
    let info = DownloadStubInfo::new(
        path,
        StubType::File,
        blob_digest,
        action_digest.unwrap_or("not-needed"),
        "not-important",
    );
    if let Some(parent) = working_dir_abs.join(path).parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return SubprocessResult {
            returncode: 1,
            stderr: vec![format!("{}: {e}", parent.display())],
            ..SubprocessResult::default()
        };
    }
    info.download(downloader, working_dir_abs, None)
}
