use rbe_common::stub::{DownloadStubInfo, is_download_stub_file};
use std::path::Path;

pub fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected to find '{needle}' in output, got: {haystack}"
    );
}

pub fn assert_path_exists(path: &Path) {
    assert!(path.exists(), "Expected path to exist: {}", path.display());
}

/// Assert that `path` is a stub recording `blob_digest`.
pub fn assert_stub(path: &Path, blob_digest: &str) {
    assert!(is_download_stub_file(path), "Expected a download stub: {}", path.display());
    let info = DownloadStubInfo::read_from_file(path).expect("Failed to read stub");
    assert_eq!(info.blob_digest, blob_digest, "stub digest of {}", path.display());
}
