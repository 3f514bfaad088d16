//! Locked and batched materialization of download stubs.
//!
//! A stub may be requested by several actions at once, possibly from
//! separate processes, so each fetch holds an advisory lock keyed by the
//! stub's path. Lock files live under `.dl-locks/` in the working directory
//! rather than beside the artifact, keeping output directories free of
//! stray files that other tools might glob.
//!
//! Batches run on a small tokio blocking pool bounded by a semaphore. If the
//! sandbox forbids creating the pool, the batch runs sequentially instead.

use crate::errors::ErrorCode;
use crate::logging::msg;
use crate::remotetool::Downloader;
use crate::stub::{DownloadStubInfo, path_to_download_stub};
use crate::subprocess::SubprocessResult;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;
pub const DOWNLOAD_LOCK_DIR: &str = ".dl-locks";

/// Per-path results. Failures are always present; successes may be.
pub type DownloadStatuses = BTreeMap<PathBuf, SubprocessResult>;

fn failure(text: String) -> SubprocessResult {
    SubprocessResult {
        returncode: 1,
        stderr: vec![text],
        ..SubprocessResult::default()
    }
}

/// Lock file location for a stub path.
pub fn download_lock_path(working_dir_abs: &Path, stub_path: &Path) -> PathBuf {
    let rel: PathBuf = stub_path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    working_dir_abs.join(DOWNLOAD_LOCK_DIR).join(rel)
}

/// Download over `stub_path` (relative to `working_dir_abs`) if it is a stub.
///
/// Holds an exclusive lock on the path for the whole operation. A caller
/// that waited on the lock finds the artifact already materialized and
/// returns without fetching. Missing paths and ordinary files succeed
/// with nothing to do.
pub fn download_from_stub_path(
    stub_path: &Path,
    downloader: &dyn Downloader,
    working_dir_abs: &Path,
) -> SubprocessResult {
    let lock_path = download_lock_path(working_dir_abs, stub_path);
    let lock_file = match lock_path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)
        }) {
        Ok(f) => f,
        Err(e) => {
            warn!(code = %ErrorCode::DownloadLockFailed.code_string(), path = %lock_path.display(), error = %e, "cannot open download lock");
            return failure(format!("{}: {e}", lock_path.display()));
        }
    };
    if let Err(e) = lock_file.lock_exclusive() {
        warn!(code = %ErrorCode::DownloadLockFailed.code_string(), path = %lock_path.display(), error = %e, "cannot acquire download lock");
        return failure(format!("{}: {e}", lock_path.display()));
    }

    let result = download_locked(stub_path, downloader, working_dir_abs);
    drop(lock_file);
    result
}

fn download_locked(
    stub_path: &Path,
    downloader: &dyn Downloader,
    working_dir_abs: &Path,
) -> SubprocessResult {
    let stub_abs = working_dir_abs.join(stub_path);
    if !stub_abs.exists() {
        msg(format!(
            "Ignoring request to download nonexistent stub: {}",
            stub_path.display()
        ));
        return SubprocessResult::with_code(0);
    }

    match path_to_download_stub(&stub_abs) {
        Ok(None) => {
            debug!(path = %stub_path.display(), "already a normal file, not downloading");
            SubprocessResult::with_code(0)
        }
        Ok(Some(info)) => {
            debug!(path = %stub_path.display(), digest = %info.blob_digest, "downloading");
            info.download(downloader, working_dir_abs, Some(stub_path))
        }
        Err(e) => failure(e.to_string()),
    }
}

/// Whether an io error means the environment cannot host a worker pool.
pub fn is_pool_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

fn build_pool() -> io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(MAX_CONCURRENT_DOWNLOADS)
        .thread_name("rbe-download")
        .build()
}

fn run_sequential<T, F>(items: Vec<(PathBuf, T)>, job: F) -> DownloadStatuses
where
    F: Fn(T) -> SubprocessResult,
{
    items
        .into_iter()
        .map(|(path, item)| (path, job(item)))
        .collect()
}

fn run_batch<T, F>(items: Vec<(PathBuf, T)>, job: F, parallel: bool) -> io::Result<DownloadStatuses>
where
    T: Send + 'static,
    F: Fn(T) -> SubprocessResult + Send + Sync + 'static,
{
    if items.is_empty() {
        return Ok(DownloadStatuses::new());
    }
    if !parallel || items.len() == 1 {
        return Ok(run_sequential(items, job));
    }

    let runtime = match build_pool() {
        Ok(rt) => rt,
        Err(e) if is_pool_unavailable(&e) => {
            warn!(code = %ErrorCode::DownloadSequentialFallback.code_string(), error = %e, "parallel downloads unavailable");
            msg("Warning: downloading sequentially instead of in parallel.");
            return Ok(run_sequential(items, job));
        }
        Err(e) => return Err(e),
    };

    let job = Arc::new(job);
    let statuses = runtime.block_on(async move {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS));
        let mut handles = Vec::with_capacity(items.len());
        for (path, item) in items {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    handles.push((path, Err(e.to_string())));
                    continue;
                }
            };
            let job = Arc::clone(&job);
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job(item)
            });
            handles.push((path, Ok(handle)));
        }

        let mut statuses = DownloadStatuses::new();
        for (path, handle) in handles {
            let status = match handle {
                Ok(h) => match h.await {
                    Ok(status) => status,
                    Err(e) => failure(format!("download task failed: {e}")),
                },
                Err(e) => failure(e),
            };
            statuses.insert(path, status);
        }
        statuses
    });
    Ok(statuses)
}

/// Materialize any stubs among `stub_paths`, e.g. inputs of a local action.
pub fn download_input_stub_paths_batch(
    downloader: Arc<dyn Downloader>,
    stub_paths: &[PathBuf],
    working_dir_abs: &Path,
    parallel: bool,
) -> io::Result<DownloadStatuses> {
    debug!(count = stub_paths.len(), "downloading potential input stubs");
    let working_dir = working_dir_abs.to_path_buf();
    let items = stub_paths.iter().map(|p| (p.clone(), p.clone())).collect();
    run_batch(
        items,
        move |path: PathBuf| {
            let status = download_from_stub_path(&path, downloader.as_ref(), &working_dir);
            if !status.success() {
                msg(format!("Unable to download input {}.", path.display()));
            }
            status
        },
        parallel,
    )
}

/// Fetch outputs described by `stub_infos`. Outputs belong to one action,
/// so no locking is needed.
pub fn download_output_stub_infos_batch(
    downloader: Arc<dyn Downloader>,
    stub_infos: &[DownloadStubInfo],
    working_dir_abs: &Path,
    parallel: bool,
) -> io::Result<DownloadStatuses> {
    let working_dir = working_dir_abs.to_path_buf();
    let items = stub_infos
        .iter()
        .map(|info| (info.path.clone(), info.clone()))
        .collect();
    run_batch(
        items,
        move |info: DownloadStubInfo| {
            let status = info.download(downloader.as_ref(), &working_dir, None);
            if !status.success() {
                msg(format!("Unable to download output {}.", info.path.display()));
            }
            status
        },
        parallel,
    )
}

/// The first failing status, if any.
pub fn first_failure(statuses: &DownloadStatuses) -> Option<(&PathBuf, &SubprocessResult)> {
    statuses.iter().find(|(_, s)| !s.success())
}
