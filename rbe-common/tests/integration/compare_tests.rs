use crate::common::{TestWorkspace, assert_path_exists, init_test_logging};
use rbe_common::compare::{CompareLayout, compare_output_pairs, files_under_dir};
use rbe_common::util::copy_preserve_subpath;
use rbe_common::{RbeEnvironment, RemoteAction};
use serial_test::serial;
use std::path::{Path, PathBuf};

fn layout(ws: &TestWorkspace) -> CompareLayout {
    CompareLayout {
        exec_root: ws.exec_root.clone(),
        working_dir: ws.working_dir.clone(),
        build_subdir: PathBuf::from("out/default"),
        remote_build_subdir: PathBuf::from("out/default"),
    }
}

#[test]
fn test_identical_trees_compare_clean() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let mut pairs = Vec::new();
    for i in 0..5 {
        let name = format!("gen/f{i}.txt");
        ws.write(&name, &format!("content {i}\n"));
        ws.write(&format!("{name}.remote"), &format!("content {i}\n"));
        pairs.push((PathBuf::from(&name), PathBuf::from(format!("{name}.remote"))));
    }
    let mismatches = compare_output_pairs(&layout(&ws), &pairs).expect("compare");
    assert!(mismatches.is_empty());
    // matching remote copies are cleaned up
    let left = files_under_dir(&ws.working_dir.join("gen")).expect("walk");
    assert_eq!(left.len(), 5);
}

#[test]
fn test_single_byte_difference_is_one_mismatch() {
    init_test_logging();
    let ws = TestWorkspace::new();
    ws.write("a.bin", "abcdef");
    ws.write("a.bin.remote", "abcdeF");
    ws.write("b.bin", "same");
    ws.write("b.bin.remote", "same");
    let pairs = [
        (PathBuf::from("a.bin"), PathBuf::from("a.bin.remote")),
        (PathBuf::from("b.bin"), PathBuf::from("b.bin.remote")),
    ];
    let mismatches = compare_output_pairs(&layout(&ws), &pairs).expect("compare");
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].local, Path::new("a.bin"));
}

#[test]
fn test_remote_depfile_matches_after_relativizing() {
    init_test_logging();
    crate::test_log!("TEST START: test_remote_depfile_matches_after_relativizing");

    let ws = TestWorkspace::new();
    let (rewrapper, _) = ws.fake_rewrapper(
        "rewrapper",
        "export FLAVOR=remote\nwhile [ \"$1\" != \"--\" ]; do shift; done\nshift\nexec \"$@\"",
    );
    let script = "if [ -n \"$FLAVOR\" ]; then echo 'a.o: /b/f/w/src/a.c' > a.d; \
                  else echo 'a.o: ../../src/a.c' > a.d; fi; echo obj > a.o";
    let mut config = ws.config(&rewrapper, &["sh", "-c", script]);
    config.output_files = vec![PathBuf::from("a.o"), PathBuf::from("a.d")];
    config.compare_with_local = true;

    let mut action = RemoteAction::new(config, RbeEnvironment::empty()).expect("valid action");
    assert_eq!(action.run(), 0);
    assert_eq!(ws.read("a.d"), "a.o: ../../src/a.c\n");

    crate::test_log!("TEST PASS: test_remote_depfile_matches_after_relativizing");
}

#[test]
fn test_output_directories_compared_file_by_file() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, _) = ws.fake_rewrapper(
        "rewrapper",
        "export FLAVOR=remote\nwhile [ \"$1\" != \"--\" ]; do shift; done\nshift\nexec \"$@\"",
    );
    let script = "mkdir -p gen && echo same > gen/a.txt && echo ${FLAVOR:-local} > gen/b.txt";
    let mut config = ws.config(&rewrapper, &["sh", "-c", script]);
    config.output_dirs = vec![PathBuf::from("gen")];
    config.compare_with_local = true;
    config.miscomparison_export_dir = Some(PathBuf::from("export"));

    let mut action = RemoteAction::new(config, RbeEnvironment::empty()).expect("valid action");
    assert_eq!(action.run(), 1);
    assert_path_exists(&ws.working_dir.join("export/out/default/gen/b.txt"));
    assert_path_exists(&ws.working_dir.join("export/out/default/gen.remote/b.txt"));
    assert!(!ws.working_dir.join("export/out/default/gen/a.txt").exists());
}

#[test]
#[serial(cwd)]
fn test_copy_preserve_subpath_from_current_dir() {
    init_test_logging();
    let ws = TestWorkspace::new();
    ws.write("obj/x/y.o", "y");
    let previous = std::env::current_dir().expect("cwd");
    std::env::set_current_dir(&ws.working_dir).expect("chdir");

    let result = copy_preserve_subpath(Path::new("obj/x/y.o"), &ws.exec_root.join("saved"));

    std::env::set_current_dir(previous).expect("restore cwd");
    result.expect("copy");
    assert_eq!(
        std::fs::read_to_string(ws.exec_root.join("saved/obj/x/y.o")).expect("read copy"),
        "y"
    );
}
