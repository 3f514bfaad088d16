use crate::common::{CountingDownloader, TestWorkspace, assert_stub, init_test_logging};
use rbe_common::download::{
    DOWNLOAD_LOCK_DIR, download_from_stub_path, download_input_stub_paths_batch, first_failure,
};
use rbe_common::stub::{STUB_BACKUP_SUFFIX, is_download_stub_file, undownload};
use rbe_common::{DownloadStubInfo, StubType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn make_stub(ws: &TestWorkspace, path: &str, digest: &str) {
    DownloadStubInfo::new(path, StubType::File, digest, "ad/1", "b1")
        .create(&ws.working_dir, None)
        .expect("create stub");
}

#[test]
fn test_concurrent_requests_fetch_once() {
    init_test_logging();
    crate::test_log!("TEST START: test_concurrent_requests_fetch_once");

    let ws = TestWorkspace::new();
    make_stub(&ws, "gen/lib.rlib", "aa/9");
    let downloader = Arc::new(CountingDownloader::new("rlib").with_delay(Duration::from_millis(50)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let downloader = Arc::clone(&downloader);
            let wd = ws.working_dir.clone();
            std::thread::spawn(move || {
                download_from_stub_path(Path::new("gen/lib.rlib"), downloader.as_ref(), &wd)
            })
        })
        .collect();
    for handle in handles {
        let status = handle.join().expect("download thread panicked");
        assert!(status.success(), "download failed: {status:?}");
    }

    assert_eq!(downloader.calls(), 1);
    assert_eq!(ws.read("gen/lib.rlib"), "rlib");
    assert_stub(&ws.working_dir.join(format!("gen/lib.rlib{STUB_BACKUP_SUFFIX}")), "aa/9");
    assert!(ws.working_dir.join(DOWNLOAD_LOCK_DIR).join("gen/lib.rlib").exists());
    // no lock debris next to the artifact
    let siblings: Vec<_> = std::fs::read_dir(ws.working_dir.join("gen"))
        .expect("read gen")
        .map(|e| e.expect("dir entry").file_name())
        .collect();
    assert_eq!(siblings.len(), 2, "unexpected files: {siblings:?}");

    crate::test_log!("TEST PASS: test_concurrent_requests_fetch_once");
}

#[test]
fn test_parallel_batch_downloads_every_stub() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let paths: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("in/{i}.h"))).collect();
    for p in &paths {
        make_stub(&ws, &p.display().to_string(), "bb/4");
    }
    ws.write("in/plain.h", "plain");
    let mut requested = paths.clone();
    requested.push(PathBuf::from("in/plain.h"));
    requested.push(PathBuf::from("in/missing.h"));

    let downloader = Arc::new(CountingDownloader::new("hdr").with_delay(Duration::from_millis(10)));
    let statuses = download_input_stub_paths_batch(downloader.clone(), &requested, &ws.working_dir, true)
        .expect("batch runs");

    assert_eq!(statuses.len(), requested.len());
    assert!(first_failure(&statuses).is_none());
    assert_eq!(downloader.calls(), paths.len());
    for p in &paths {
        assert!(!is_download_stub_file(&ws.working_dir.join(p)));
    }
    assert_eq!(ws.read("in/plain.h"), "plain");
}

#[test]
fn test_batch_reports_first_failure() {
    init_test_logging();
    let ws = TestWorkspace::new();
    make_stub(&ws, "a.h", "cc/1");
    make_stub(&ws, "b.h", "cc/2");
    let downloader = Arc::new(CountingDownloader::new("").failing());
    let statuses = download_input_stub_paths_batch(
        downloader,
        &[PathBuf::from("a.h"), PathBuf::from("b.h")],
        &ws.working_dir,
        false,
    )
    .expect("batch runs");

    let (path, status) = first_failure(&statuses).expect("a failure");
    assert_eq!(path, Path::new("a.h"));
    assert_eq!(status.stderr_text(), "blob not found");
    assert!(is_download_stub_file(&ws.working_dir.join("a.h")));
    assert!(is_download_stub_file(&ws.working_dir.join("b.h")));
}

#[test]
fn test_undownload_after_download() {
    init_test_logging();
    let ws = TestWorkspace::new();
    make_stub(&ws, "a.o", "dd/3");
    let downloader = CountingDownloader::new("obj");
    assert!(download_from_stub_path(Path::new("a.o"), &downloader, &ws.working_dir).success());
    assert_eq!(ws.read("a.o"), "obj");

    assert!(undownload(&ws.working_dir.join("a.o")).expect("undownload"));
    assert_stub(&ws.working_dir.join("a.o"), "dd/3");
    assert!(!ws.working_dir.join(format!("a.o{STUB_BACKUP_SUFFIX}")).exists());

    // downloading again works from the restored stub
    assert!(download_from_stub_path(Path::new("a.o"), &downloader, &ws.working_dir).success());
    assert_eq!(downloader.calls(), 2);
}
