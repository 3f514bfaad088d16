//! rbe-dl: download, restore, and inspect remote-execution download stubs.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rbe_common::download::{download_input_stub_paths_batch, first_failure};
use rbe_common::logging::set_program_name;
use rbe_common::reproxy_log::ReproxyLogEntry;
use rbe_common::stub::{download_file_to_path, path_to_download_stub, undownload};
use rbe_common::{Downloader, LogConfig, RbeEnvironment, RemoteTool, init_logging, msg};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const PROGRAM: &str = "rbe-dl";

#[derive(Parser)]
#[command(name = "rbe-dl")]
#[command(version, about = "Download, restore, and inspect remote-execution download stubs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding remotetool (default: <project>/prebuilt/reclient)
    #[arg(long, global = true, value_name = "PATH")]
    bindir: Option<PathBuf>,

    /// reproxy config used to configure remotetool
    /// (default: <project>/build/rbe/reproxy.cfg)
    #[arg(long = "reproxy-cfg", global = true, value_name = "FILE")]
    reproxy_cfg: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace stubs with the artifacts they describe
    ///
    /// Paths that are not stubs are left alone. Concurrent invocations for
    /// the same path fetch it only once.
    Download {
        /// Stub paths, relative to the current directory
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Fetch one at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Put back the stub that a download replaced
    Undownload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the contents of a stub
    Show {
        path: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch an output named in an action log, e.g. from a failed action
    FetchOutput {
        /// rewrapper `--action_log` file (.rrpl)
        #[arg(long = "action-log", value_name = "RRPL")]
        action_log: PathBuf,

        /// Output path as recorded in the log, relative to the current directory
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    set_program_name(PROGRAM);
    let cli = Cli::parse();

    let log_config = LogConfig::from_env("warn").with_verbose(cli.verbose);
    let _log_guard = init_logging(&log_config)?;

    let status = run(&cli)?;
    std::process::exit(status);
}

fn run(cli: &Cli) -> Result<i32> {
    let working_dir = std::env::current_dir().context("cannot determine the working directory")?;
    match &cli.command {
        Commands::Download { paths, sequential } => {
            let downloader = remotetool(cli, &working_dir)?;
            let statuses = download_input_stub_paths_batch(downloader, paths, &working_dir, !sequential)
                .context("download batch failed")?;
            info!(count = statuses.len(), "download batch finished");
            Ok(match first_failure(&statuses) {
                Some((path, status)) => {
                    msg(format!("Download of {} failed:\n{}", path.display(), status.stderr_text()));
                    status.returncode
                }
                None => 0,
            })
        }
        Commands::Undownload { paths } => {
            for path in paths {
                let restored = undownload(&working_dir.join(path))
                    .with_context(|| format!("cannot restore stub for {}", path.display()))?;
                if restored {
                    msg(format!("Restored stub: {}", path.display()));
                } else {
                    debug!(path = %path.display(), "no stub backup to restore");
                }
            }
            Ok(0)
        }
        Commands::Show { path, json } => {
            let Some(info) = path_to_download_stub(&working_dir.join(path))? else {
                bail!("{} is not a download stub", path.display());
            };
            if *json {
                let value = serde_json::json!({
                    "path": info.path,
                    "type": info.kind.to_string(),
                    "blob_digest": info.blob_digest,
                    "action_digest": info.action_digest,
                    "build_id": info.build_id,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for line in info.to_lines().iter().skip(2) {
                    println!("{line}");
                }
            }
            Ok(0)
        }
        Commands::FetchOutput { action_log, path } => {
            let record = ReproxyLogEntry::parse_action_log(&working_dir.join(action_log))?;
            let Some(digest) = record.output_file_digests.get(path) else {
                bail!("{} has no output named {}", action_log.display(), path.display());
            };
            let downloader = remotetool(cli, &working_dir)?;
            Ok(download_file_to_path(
                downloader.as_ref(),
                &working_dir,
                path,
                digest,
                Some(record.action_digest.as_str()),
            )
            .verbose_returncode(&format!("download {}", path.display())))
        }
    }
}

fn remotetool(cli: &Cli, working_dir: &Path) -> Result<Arc<dyn Downloader>> {
    let (env, _) = RbeEnvironment::capture();
    let project_root = env.project_root_for(working_dir);
    let tool = cli
        .bindir
        .clone()
        .unwrap_or_else(|| project_root.join("prebuilt/reclient"))
        .join("remotetool");
    let cfg = cli
        .reproxy_cfg
        .clone()
        .unwrap_or_else(|| project_root.join("build/rbe/reproxy.cfg"));
    debug!(tool = %tool.display(), cfg = %cfg.display(), "configuring remotetool");
    let remotetool = RemoteTool::from_reproxy_cfg(tool, &cfg)
        .with_context(|| format!("cannot configure remotetool from {}", cfg.display()))?;
    Ok(Arc::new(remotetool))
}
