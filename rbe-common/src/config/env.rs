//! Typed reads over a snapshot of environment variables.
//!
//! The reader never touches the live process environment after
//! construction; tests hand in fixed maps.

use super::source::Sourced;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var} names a path that does not exist: {path}")]
    PathNotFound { var: String, path: PathBuf },

    #[error("{var} is not a log level: {value}")]
    InvalidLogLevel { var: String, value: String },
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Reads variables sharing one prefix (`RBE_`, `REMOTE_ACTION_`, or none).
///
/// Problems are collected rather than returned so every bad variable can be
/// reported in one pass.
pub struct EnvParser {
    prefix: &'static str,
    vars: BTreeMap<String, String>,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new(prefix: &'static str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    pub fn from_vars<I, K, V>(prefix: &'static str, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix,
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            errors: Vec::new(),
        }
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name and its value, if set.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var = format!("{}{name}", self.prefix);
        let value = self.vars.get(&var).cloned();
        (var, value)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match self.lookup(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// Unset and empty both read as `None`.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (var, Some(value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    /// Like [`get_optional_string`](Self::get_optional_string), as a path.
    /// With `must_exist`, a missing path is recorded as an error but still
    /// returned.
    pub fn get_optional_path(&mut self, name: &str, must_exist: bool) -> Sourced<Option<PathBuf>> {
        let read = self.get_optional_string(name);
        let path = read.value.map(PathBuf::from);
        if let (true, Some(path), Some(var)) = (must_exist, &path, &read.origin) {
            if !path.exists() {
                self.errors.push(EnvError::PathNotFound {
                    var: var.clone(),
                    path: path.clone(),
                });
            }
        }
        Sourced {
            value: path,
            source: read.source,
            origin: read.origin,
        }
    }

    /// A tracing level name, lowercased. Unknown names fall back to
    /// `default` and are recorded as errors.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, value) = self.lookup(name);
        let Some(value) = value else {
            return Sourced::default_value(default.to_string());
        };
        let lower = value.to_lowercase();
        if LOG_LEVELS.contains(&lower.as_str()) {
            Sourced::from_env(lower, var)
        } else {
            self.errors.push(EnvError::InvalidLogLevel { var: var.clone(), value });
            Sourced::from_env(default.to_string(), var)
        }
    }
}
