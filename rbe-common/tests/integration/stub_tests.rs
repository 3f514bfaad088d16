use crate::common::{TestWorkspace, init_test_logging};
use proptest::prelude::*;
use rbe_common::action::StubUpdate;
use rbe_common::digest::get_blob_digest;
use rbe_common::{DownloadStubInfo, RbeEnvironment, RemoteAction, StubType};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn stub_type() -> impl Strategy<Value = StubType> {
    prop_oneof![Just(StubType::File), Just(StubType::Dir)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_stub_survives_write_and_read(
        path in "[a-z]{1,8}(/[a-z_]{1,8}){0,2}(\\.[a-z]{1,3})?",
        kind in stub_type(),
        hash in "[0-9a-f]{64}",
        size in 0u64..10_000_000_000,
        action_digest in "[0-9a-f]{64}/[0-9]{1,6}",
        build_id in "[A-Za-z0-9-]{1,24}",
    ) {
        let tmp = TempDir::new().unwrap();
        let info = DownloadStubInfo::new(&path, kind, format!("{hash}/{size}"), &action_digest, &build_id);
        info.create(tmp.path(), None).unwrap();

        let read = DownloadStubInfo::read_from_file(&tmp.path().join(&path)).unwrap();
        prop_assert_eq!(&read, &info);
        prop_assert_eq!(&read.action_digest, &action_digest);

        let first = fs::read(tmp.path().join(&path)).unwrap();
        read.create(tmp.path(), None).unwrap();
        prop_assert_eq!(first, fs::read(tmp.path().join(&path)).unwrap());
    }

    #[test]
    fn test_reading_arbitrary_text_never_panics(text in ".{0,200}") {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x");
        fs::write(&path, &text).unwrap();
        let _ = DownloadStubInfo::read_from_file(&path);
    }
}

fn set_mtime(path: &std::path::Path, when: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .expect("open for mtime")
        .set_modified(when)
        .expect("set mtime");
}

fn mtime(path: &std::path::Path) -> SystemTime {
    fs::metadata(path).expect("stat").modified().expect("mtime")
}

#[test]
fn test_unchanged_artifact_keeps_mtime() {
    init_test_logging();
    crate::test_log!("TEST START: test_unchanged_artifact_keeps_mtime");

    let ws = TestWorkspace::new();
    let artifact = ws.write("a.o", "object code");
    let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    set_mtime(&artifact, old);
    let digest = get_blob_digest(&artifact).expect("digest");

    let mut config = ws.config(&PathBuf::from("/bin/true"), &["cc"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec![
        "--download_outputs=false".to_string(),
        "--preserve_unchanged_output_mtime".to_string(),
    ];
    let action = RemoteAction::new(config, RbeEnvironment::empty()).expect("valid action");

    let same = DownloadStubInfo::new("a.o", StubType::File, &digest, "ad/1", "b1");
    assert_eq!(action.update_stub(&same).expect("update"), StubUpdate::Preserved);
    assert_eq!(ws.read("a.o"), "object code");
    assert_eq!(mtime(&artifact), old);

    let changed = DownloadStubInfo::new("a.o", StubType::File, "ee/5", "ad/2", "b1");
    assert_eq!(action.update_stub(&changed).expect("update"), StubUpdate::Written);
    assert_ne!(mtime(&artifact), old);
    assert_eq!(DownloadStubInfo::read_from_file(&artifact).expect("stub").blob_digest, "ee/5");

    crate::test_log!("TEST PASS: test_unchanged_artifact_keeps_mtime");
}

#[test]
fn test_same_digest_stub_left_untouched() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let info = DownloadStubInfo::new("a.o", StubType::File, "ff/8", "ad/1", "b1");
    info.create(&ws.working_dir, None).expect("create");
    let stub = ws.working_dir.join("a.o");
    let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    set_mtime(&stub, old);

    let mut config = ws.config(&PathBuf::from("/bin/true"), &["cc"]);
    config.options = vec![
        "--download_outputs=false".to_string(),
        "--preserve_unchanged_output_mtime".to_string(),
    ];
    let action = RemoteAction::new(config, RbeEnvironment::empty()).expect("valid action");
    let rebuilt = DownloadStubInfo::new("a.o", StubType::File, "ff/8", "ad/other", "b2");
    assert_eq!(action.update_stub(&rebuilt).expect("update"), StubUpdate::Preserved);
    assert_eq!(mtime(&stub), old);
}
