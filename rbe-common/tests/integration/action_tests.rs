use crate::common::fixtures::call_count;
use crate::common::{
    CountingDownloader, TestWorkspace, assert_contains, assert_path_exists, assert_stub,
    init_test_logging,
};
use rbe_common::action::ExecStrategy;
use rbe_common::stub::{STUB_BACKUP_SUFFIX, is_download_stub_file};
use rbe_common::{RbeEnvironment, RemoteAction};
use std::path::PathBuf;
use std::sync::Arc;

/// Skip rewrapper's flags and run the wrapped command.
const PASSTHROUGH: &str = r#"while [ "$1" != "--" ]; do shift; done
shift
exec "$@""#;

fn run(config: rbe_common::RemoteActionConfig) -> i32 {
    RemoteAction::new(config, RbeEnvironment::empty())
        .expect("valid action")
        .run()
}

#[test]
fn test_server_error_is_retried_once() {
    init_test_logging();
    crate::test_log!("TEST START: test_server_error_is_retried_once");

    let ws = TestWorkspace::new();
    let (rewrapper, calls) = ws.fake_rewrapper("rewrapper", "exit 45");
    assert_eq!(run(ws.config(&rewrapper, &["cc"])), 45);
    assert_eq!(call_count(&calls), 2);

    crate::test_log!("TEST PASS: test_server_error_is_retried_once");
}

#[test]
fn test_ordinary_failure_is_not_retried() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, calls) = ws.fake_rewrapper("rewrapper", "exit 1");
    assert_eq!(run(ws.config(&rewrapper, &["cc"])), 1);
    assert_eq!(call_count(&calls), 1);
}

#[test]
fn test_missing_header_vetoes_retry() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, calls) = ws.fake_rewrapper(
        "rewrapper",
        "echo \"../../src/a.c:1:10: fatal error: 'a.h' file not found\" >&2\nexit 35",
    );
    assert_eq!(run(ws.config(&rewrapper, &["cc"])), 35);
    assert_eq!(call_count(&calls), 1);
}

#[test]
fn test_fail_to_dial_is_retried_regardless_of_status() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, calls) = ws.fake_rewrapper(
        "rewrapper",
        "echo 'Fail to dial unix:///tmp/reproxy.sock: context deadline exceeded' >&2\nexit 1",
    );
    assert_eq!(run(ws.config(&rewrapper, &["cc"])), 1);
    assert_eq!(call_count(&calls), 2);
}

#[test]
fn test_retry_can_succeed() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let calls = ws.exec_root.join("flaky.calls");
    let (rewrapper, _) = ws.fake_rewrapper(
        "flaky",
        &format!(
            "if [ \"$(wc -l < '{}')\" -lt 2 ]; then exit 137; fi\nexit 0",
            calls.display()
        ),
    );
    assert_eq!(run(ws.config(&rewrapper, &["cc"])), 0);
    assert_eq!(call_count(&calls), 2);
}

#[test]
fn test_rewrapper_receives_action_layout() {
    init_test_logging();
    crate::test_log!("TEST START: test_rewrapper_receives_action_layout");

    let ws = TestWorkspace::new();
    let args = ws.exec_root.join("args.txt");
    let (rewrapper, _) = ws.fake_rewrapper(
        "rewrapper",
        &format!("for a in \"$@\"; do echo \"$a\" >> '{}'; done\n{PASSTHROUGH}", args.display()),
    );
    ws.write("a.c", "int x;\n");
    let mut config = ws.config(&rewrapper, &["sh", "-c", "echo built > a.o"]);
    config.inputs = vec![PathBuf::from("a.c")];
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec!["--labels=type=tool".to_string()];

    assert_eq!(run(config), 0);
    assert_eq!(ws.read("a.o"), "built\n");

    let recorded = std::fs::read_to_string(&args).expect("rewrapper args recorded");
    let lines: Vec<&str> = recorded.lines().collect();
    assert_eq!(lines[0], format!("--exec_root={}", ws.exec_root.display()));
    assert_contains(&recorded, "--labels=type=tool\n");
    assert_contains(&recorded, "--input_list_paths=a.o.inputs\n");
    assert_contains(&recorded, "--output_files=out/default/a.o\n");
    let sep = lines.iter().position(|l| *l == "--").expect("separator");
    assert_eq!(&lines[sep + 1..], ["sh", "-c", "echo built > a.o"]);
    // inputs list is temporary
    assert!(!ws.working_dir.join("a.o.inputs").exists());

    crate::test_log!("TEST PASS: test_rewrapper_receives_action_layout");
}

#[test]
fn test_env_platform_replaces_cfg_and_flag_overrides() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let args = ws.exec_root.join("args.txt");
    let (rewrapper, _) = ws.fake_rewrapper(
        "rewrapper",
        &format!("for a in \"$@\"; do echo \"$a\" >> '{}'; done", args.display()),
    );
    std::fs::write(
        ws.exec_root.join("build/rbe/rewrapper.cfg"),
        "platform=a=1,b=2,container-image=x\n",
    )
    .expect("write cfg");

    let mut config = ws.config(&rewrapper, &["cc"]);
    config.cfg = Some(PathBuf::from("../../build/rbe/rewrapper.cfg"));
    config.platform = Some("a=4".to_string());
    let (env, errors) = RbeEnvironment::from_vars([("RBE_platform".to_string(), "a=2,b=3".to_string())]);
    assert!(errors.is_empty());

    let mut action = RemoteAction::new(config, env).expect("valid action");
    assert_eq!(action.run(), 0);
    let recorded = std::fs::read_to_string(&args).expect("rewrapper args recorded");
    assert_contains(&recorded, "--platform=a=4,b=3\n");
    assert!(!recorded.contains("container-image"), "env platform replaces cfg platform");
}

/// A rewrapper that runs nothing but leaves an action log naming `a.o`.
fn stubbing_rewrapper(ws: &TestWorkspace, digest: &str) -> PathBuf {
    let (rewrapper, _) = ws.fake_rewrapper(
        "rewrapper",
        &format!(
            "cat > a.o.rrpl <<'EOF'\nremote_metadata: {{\n  action_digest: \"ad/1\"\n  output_file_digests: {{ key: \"a.o\" value: \"{digest}\" }}\n}}\ncompletion_status: STATUS_REMOTE_EXECUTION\nEOF"
        ),
    );
    rewrapper
}

#[test]
fn test_remote_outputs_become_stubs() {
    init_test_logging();
    crate::test_log!("TEST START: test_remote_outputs_become_stubs");

    let ws = TestWorkspace::new();
    let rewrapper = stubbing_rewrapper(&ws, "abc123/3");
    let mut config = ws.config(&rewrapper, &["cc", "-o", "a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec!["--download_outputs=false".to_string()];

    assert_eq!(run(config), 0);
    assert_stub(&ws.working_dir.join("a.o"), "abc123/3");

    crate::test_log!("TEST PASS: test_remote_outputs_become_stubs");
}

#[test]
fn test_download_regex_keeps_matching_outputs() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let rewrapper = stubbing_rewrapper(&ws, "abc123/3");
    let mut config = ws.config(&rewrapper, &["cc", "-o", "a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec!["--download_regex=.*\\.o$".to_string()];

    assert_eq!(run(config), 0);
    assert!(!ws.working_dir.join("a.o").exists());
}

#[test]
fn test_stubbed_outputs_downloaded_on_request() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let rewrapper = stubbing_rewrapper(&ws, "abc123/12");
    let mut config = ws.config(&rewrapper, &["cc", "-o", "a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec!["--download_outputs=false".to_string()];
    config.download_stubbed_outputs = true;

    let downloader = Arc::new(CountingDownloader::new("remote bytes"));
    let mut action = RemoteAction::new(config, RbeEnvironment::empty())
        .expect("valid action")
        .with_downloader(downloader.clone());
    assert_eq!(action.run(), 0);

    assert_eq!(downloader.calls(), 1);
    assert_eq!(ws.read("a.o"), "remote bytes");
    assert!(!is_download_stub_file(&ws.working_dir.join("a.o")));
    assert_stub(
        &ws.working_dir.join(format!("a.o{STUB_BACKUP_SUFFIX}")),
        "abc123/12",
    );
}

#[test]
fn test_failed_output_download_fails_action() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let rewrapper = stubbing_rewrapper(&ws, "abc123/12");
    let mut config = ws.config(&rewrapper, &["cc", "-o", "a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.options = vec!["--download_outputs=false".to_string()];
    config.download_stubbed_outputs = true;

    let mut action = RemoteAction::new(config, RbeEnvironment::empty())
        .expect("valid action")
        .with_downloader(Arc::new(CountingDownloader::new("").failing()));
    assert_eq!(action.run(), 1);
    assert_stub(&ws.working_dir.join("a.o"), "abc123/12");
}

#[test]
fn test_stubbed_local_inputs_downloaded_before_fallback() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, _) = ws.fake_rewrapper("rewrapper", PASSTHROUGH);
    rbe_common::DownloadStubInfo::new(
        "gen/a.h",
        rbe_common::StubType::File,
        "feed/7",
        "ad/1",
        "b1",
    )
    .create(&ws.working_dir, None)
    .expect("create stub");

    let mut config = ws.config(&rewrapper, &["sh", "-c", "cat gen/a.h > a.o"]);
    config.inputs = vec![PathBuf::from("gen/a.h")];
    config.output_files = vec![PathBuf::from("a.o")];
    config.exec_strategy = Some(ExecStrategy::RemoteLocalFallback);

    let downloader = Arc::new(CountingDownloader::new("#define A\n"));
    let mut action = RemoteAction::new(config, RbeEnvironment::empty())
        .expect("valid action")
        .with_downloader(downloader.clone());
    assert_eq!(action.run(), 0);
    assert_eq!(downloader.calls(), 1);
    assert_eq!(ws.read("a.o"), "#define A\n");
}

#[test]
fn test_local_fallback_reruns_with_local_flags() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let (rewrapper, calls) = ws.fake_rewrapper("rewrapper", "exit 1");
    let mut config = ws.config(
        &rewrapper,
        &["sh", "-c", "echo local \"$0\" > a.o", "--local-only=dbg"],
    );
    config.output_files = vec![PathBuf::from("a.o")];
    config.exec_strategy = Some(ExecStrategy::RemoteLocalFallback);

    assert_eq!(run(config), 0);
    assert_eq!(call_count(&calls), 1);
    assert_eq!(ws.read("a.o"), "local dbg\n");
}

/// Exports FLAVOR=remote into the wrapped command.
fn flavored_rewrapper(ws: &TestWorkspace) -> PathBuf {
    ws.fake_rewrapper("rewrapper", &format!("export FLAVOR=remote\n{PASSTHROUGH}"))
        .0
}

#[test]
fn test_compare_identical_outputs() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let rewrapper = flavored_rewrapper(&ws);
    let mut config = ws.config(&rewrapper, &["sh", "-c", "echo same > a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.compare_with_local = true;

    assert_eq!(run(config), 0);
    assert_eq!(ws.read("a.o"), "same\n");
    assert!(!ws.working_dir.join("a.o.remote").exists());
}

#[test]
fn test_compare_reports_and_exports_differences() {
    init_test_logging();
    crate::test_log!("TEST START: test_compare_reports_and_exports_differences");

    let ws = TestWorkspace::new();
    let rewrapper = flavored_rewrapper(&ws);
    let mut config = ws.config(&rewrapper, &["sh", "-c", "echo ${FLAVOR:-local} > a.o"]);
    config.output_files = vec![PathBuf::from("a.o")];
    config.compare_with_local = true;
    config.miscomparison_export_dir = Some(PathBuf::from("miscompare"));

    assert_eq!(run(config), 1);
    assert_eq!(ws.read("a.o"), "local\n");
    assert_eq!(ws.read("a.o.remote"), "remote\n");
    assert_path_exists(&ws.working_dir.join("miscompare/out/default/a.o"));
    assert_path_exists(&ws.working_dir.join("miscompare/out/default/a.o.remote"));

    crate::test_log!("TEST PASS: test_compare_reports_and_exports_differences");
}

#[test]
fn test_determinism_check_flags_unstable_output() {
    init_test_logging();
    let ws = TestWorkspace::new();
    let counter = ws.exec_root.join("n");
    let mut config = ws.config(
        &PathBuf::from("/nonexistent/rewrapper"),
        &[
            "sh",
            "-c",
            &format!("echo x >> '{0}'; wc -l < '{0}' > a.o", counter.display()),
        ],
    );
    config.disable = true;
    config.check_determinism = true;
    config.output_files = vec![PathBuf::from("a.o")];

    assert_eq!(run(config), 1);
}
