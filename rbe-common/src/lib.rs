//! Shared library for the remote action wrapper and the download tool.
//!
//! This crate contains the orchestration of rewrapper invocations
//! ([`action`]), download stubs and their parallel retrieval, comparison of
//! local and remote outputs, and the configuration, logging and error
//! plumbing both binaries share.

#![forbid(unsafe_code)]

pub mod action;
pub mod compare;
pub mod config;
pub mod depfile;
pub mod determinism;
pub mod diagnostics;
pub mod digest;
pub mod download;
pub mod errors;
pub mod flags;
pub mod leak_scan;
pub mod logging;
pub mod platform;
pub mod remotetool;
pub mod reproxy_log;
pub mod stub;
pub mod subprocess;
pub mod testing;
pub mod textproto;
pub mod util;

pub use action::{
    ActionLayout, ExecStrategy, PostSuccessAction, RemoteAction, RemoteActionConfig, RemoteLog,
    StubUpdate,
};
pub use config::{ConfigError, RbeEnvironment};
pub use errors::{ActionError, ErrorCode};
pub use logging::{LogConfig, init_logging, msg};
pub use remotetool::{Downloader, RemoteTool};
pub use stub::{DownloadStubInfo, StubType};
pub use subprocess::{CallOptions, SubprocessResult, subprocess_call};
