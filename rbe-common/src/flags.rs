//! Lifting wrapper flags out of a wrapped command.
//!
//! Build systems make it awkward to pass per-action options to a wrapper, so
//! the wrapped command may carry flags like `--remote-inputs=foo.h`. These are
//! removed from the command and turned into wrapper flags, keeping their
//! left-to-right order.

use crate::util::partition_sequence;
use tracing::warn;

/// One flag recognized inside a wrapped command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedFlag {
    /// Name as it appears in the wrapped command, e.g. `--remote-inputs`.
    pub name: &'static str,
    /// Whether the flag takes a value (`--name=V` or `--name V`).
    pub has_optarg: bool,
    /// Wrapper flag to emit. Empty means emit the bare value.
    pub mapped_name: &'static str,
}

impl ForwardedFlag {
    pub const fn new(name: &'static str, has_optarg: bool, mapped_name: &'static str) -> Self {
        Self {
            name,
            has_optarg,
            mapped_name,
        }
    }

    fn forward(&self, value: &str) -> String {
        if self.mapped_name.is_empty() {
            value.to_string()
        } else {
            format!("{}={}", self.mapped_name, value)
        }
    }
}

/// Separates recognized flags from the rest of a command.
#[derive(Debug, Clone)]
pub struct FlagForwarder {
    flags: Vec<ForwardedFlag>,
}

impl FlagForwarder {
    pub fn new(flags: Vec<ForwardedFlag>) -> Self {
        Self { flags }
    }

    fn lookup(&self, name: &str) -> Option<&ForwardedFlag> {
        self.flags.iter().find(|f| f.name == name)
    }

    /// Split `argv` into (forwarded flags, remaining command).
    pub fn sift<S: AsRef<str>>(&self, argv: &[S]) -> (Vec<String>, Vec<String>) {
        let mut forwarded = Vec::new();
        let mut filtered = Vec::new();
        let mut pending: Option<&ForwardedFlag> = None;

        for tok in argv.iter().map(AsRef::as_ref) {
            if let Some(flag) = pending.take() {
                forwarded.push(flag.forward(tok));
                continue;
            }

            let (left, value) = match tok.split_once('=') {
                Some((l, r)) => (l, Some(r)),
                None => (tok, None),
            };
            match self.lookup(left) {
                Some(flag) if flag.has_optarg => match value {
                    Some(v) => forwarded.push(flag.forward(v)),
                    None => pending = Some(flag),
                },
                Some(flag) => {
                    if value.is_some() {
                        warn!(flag = flag.name, "ignoring value of flag that takes none");
                    }
                    forwarded.push(flag.mapped_name.to_string());
                }
                None => filtered.push(tok.to_string()),
            }
        }

        if let Some(flag) = pending {
            warn!(flag = flag.name, "flag at end of command is missing its value");
        }
        (forwarded, filtered)
    }
}

/// `--remote-*` flags understood inside the wrapped command.
pub fn remote_flag_forwarder() -> FlagForwarder {
    FlagForwarder::new(vec![
        ForwardedFlag::new("--remote-disable", false, "--local"),
        ForwardedFlag::new("--remote-inputs", true, "--inputs"),
        ForwardedFlag::new("--remote-outputs", true, "--output_files"),
        ForwardedFlag::new("--remote-output-dirs", true, "--output_directories"),
        ForwardedFlag::new("--remote-flag", true, ""),
    ])
}

/// `--local-only` flags are hidden from the remote command and re-applied
/// through the local wrapper script.
pub fn local_only_flag_forwarder() -> FlagForwarder {
    FlagForwarder::new(vec![ForwardedFlag::new("--local-only", true, "")])
}

/// Split a full wrapper invocation at the first `--` and move `--remote-*`
/// flags from the wrapped command into the wrapper's arguments.
///
/// Returns `None` when there is no `--`, in which case the caller should
/// print usage.
pub fn forward_remote_flags<S: AsRef<str>>(argv: &[S]) -> Option<(Vec<String>, Vec<String>)> {
    let argv: Vec<&str> = argv.iter().map(AsRef::as_ref).collect();
    let (script_args, sep, command) = partition_sequence(&argv, &"--");
    sep?;

    let (forwarded, filtered) = remote_flag_forwarder().sift(command);
    let mut main_args: Vec<String> = script_args.iter().map(|s| s.to_string()).collect();
    main_args.extend(forwarded);
    Some((main_args, filtered))
}
