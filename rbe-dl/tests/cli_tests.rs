use std::fs;
use std::process::Command;
use tempfile::TempDir;

const STUB: &str = "# RBE download stub
# run //build/rbe/dlwrap.py on this file to download
path=obj/a.o
type=file
blob_digest=0a1b/42
action_digest=ad/7
build_id=b-1
";

fn rbe_dl(dir: &TempDir, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_rbe-dl"))
        .args(args)
        .current_dir(dir.path())
        .env("REMOTE_ACTION_PROJECT_ROOT", dir.path())
        .output()
        .expect("Failed to run rbe-dl")
}

#[test]
fn test_show_json() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir_all(dir.path().join("obj")).expect("Failed to create obj");
    fs::write(dir.path().join("obj/a.o"), STUB).expect("Failed to write stub");

    let output = rbe_dl(&dir, &["show", "--json", "obj/a.o"]);
    assert!(output.status.success(), "{output:?}");
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("show --json prints JSON");
    assert_eq!(value["type"], "file");
    assert_eq!(value["blob_digest"], "0a1b/42");
    assert_eq!(value["build_id"], "b-1");
}

#[test]
fn test_show_rejects_plain_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(dir.path().join("plain.txt"), "hello\n").expect("Failed to write file");
    let output = rbe_dl(&dir, &["show", "plain.txt"]);
    assert!(!output.status.success());
}

#[test]
fn test_download_of_plain_files_is_noop() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::create_dir_all(dir.path().join("build/rbe")).expect("Failed to create build/rbe");
    fs::write(dir.path().join("build/rbe/reproxy.cfg"), "service=example:443\n")
        .expect("Failed to write reproxy.cfg");
    fs::write(dir.path().join("plain.txt"), "hello\n").expect("Failed to write file");

    let output = rbe_dl(&dir, &["download", "plain.txt", "missing.txt"]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(
        fs::read_to_string(dir.path().join("plain.txt")).expect("read"),
        "hello\n"
    );
}
