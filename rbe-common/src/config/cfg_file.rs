//! Reader for rewrapper/reproxy `key=value` configuration files.
//!
//! These files are line oriented: `#` starts a comment, blank lines are
//! ignored, and a later duplicate key replaces an earlier one.

use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse config file lines into a key/value map.
pub fn read_config_file_lines<'a, I>(lines: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut values = BTreeMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    values
}

/// Read and parse a config file from disk.
pub fn read_config_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(read_config_file_lines(text.lines()))
}

/// Group `key=value` items by key, keeping every value in order of appearance.
///
/// Items without `=` map to an empty value list entry of `""`.
pub fn keyed_flags_to_values_dict<'a, I>(items: I) -> BTreeMap<String, Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = item.split_once('=').unwrap_or((item, ""));
        values
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    values
}

/// Parse a comma-separated `k=v,k=v` string, keeping the last value per key.
pub fn last_values_dict(key_values: &str) -> BTreeMap<String, String> {
    keyed_flags_to_values_dict(key_values.split(','))
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().last().unwrap_or_default()))
        .collect()
}

/// Render a map back to the `k=v,k=v` flag value form.
pub fn values_dict_to_config_value(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
