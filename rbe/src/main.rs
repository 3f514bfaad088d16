//! remote-action: run one build action through rewrapper.
//!
//! Usage: `remote-action [OPTIONS] [REWRAPPER_OPTIONS] -- COMMAND [ARGS]...`

#![forbid(unsafe_code)]

mod cli;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use cli::{Cli, split_known_args};
use rbe_common::flags::forward_remote_flags;
use rbe_common::logging::set_program_name;
use rbe_common::{LogConfig, RbeEnvironment, RemoteAction, init_logging, msg};
use tracing::{debug, warn};

const PROGRAM: &str = "remote-action";

/// Exit status for a malformed invocation.
const USAGE_STATUS: i32 = 2;

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let status = run(&argv)?;
    std::process::exit(status);
}

fn is_help_request(argv: &[String]) -> bool {
    argv.iter()
        .any(|a| matches!(a.as_str(), "-h" | "--help" | "-V" | "--version"))
}

fn run(argv: &[String]) -> Result<i32> {
    set_program_name(PROGRAM);

    let Some((main_args, command)) = forward_remote_flags(argv) else {
        if argv.iter().any(|a| matches!(a.as_str(), "-V" | "--version")) {
            print!("{}", Cli::command().render_version());
            return Ok(0);
        }
        if is_help_request(argv) {
            Cli::command().print_long_help()?;
            return Ok(0);
        }
        Cli::command().print_help()?;
        if argv.is_empty() {
            return Ok(0);
        }
        msg("Error: expected '--' before the command to run.");
        return Ok(USAGE_STATUS);
    };

    let (known, options) = split_known_args(&main_args);
    let cli = Cli::parse_from(std::iter::once(PROGRAM.to_string()).chain(known));

    let log_config = LogConfig::from_env("warn").with_verbose(cli.verbose);
    let _log_guard = init_logging(&log_config)?;

    let (env, env_errors) = RbeEnvironment::capture();
    for err in env_errors {
        warn!(error = %err, "ignoring invalid environment setting");
    }
    debug!(
        platform = %env.platform,
        proxy_log_dir = %env.proxy_log_dir,
        "captured environment"
    );
    if cli.auto_reproxy {
        debug!("--auto-reproxy is obsolete and ignored");
    }
    if command.is_empty() {
        msg("Error: no command given after '--'.");
        return Ok(USAGE_STATUS);
    }

    let working_dir = std::env::current_dir().context("cannot determine the working directory")?;
    let project_root = env.project_root_for(&working_dir);
    debug!(
        project_root = %project_root.display(),
        working_dir = %working_dir.display(),
        rewrapper_options = ?options,
        "resolved action roots"
    );

    let config = cli.to_config(&project_root, &working_dir, options, command);
    let mut action = RemoteAction::new(config, env).context("invalid remote action")?;
    Ok(action.run_with_dry_run(cli.dry_run))
}
