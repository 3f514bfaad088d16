//! Merging of rewrapper `--platform` values.
//!
//! A non-empty `RBE_platform` replaces the `platform=` entry of the rewrapper
//! config file outright. The explicit `--platform` flag is then merged over
//! whichever of the two applied, key by key. Inside one source the last
//! duplicate key wins.

use crate::config::cfg_file::{last_values_dict, read_config_file, values_dict_to_config_value};
use crate::config::ConfigError;
use std::collections::BTreeMap;
use std::path::Path;

/// Merge the three platform sources into one key/value map.
pub fn merge_platform(
    cfg_platform: Option<&str>,
    env_platform: Option<&str>,
    flag_platform: Option<&str>,
) -> BTreeMap<String, String> {
    let env_platform = env_platform.filter(|s| !s.is_empty());
    let base = env_platform.or(cfg_platform);
    let mut merged = BTreeMap::new();
    for layer in [base, flag_platform].into_iter().flatten().filter(|s| !s.is_empty()) {
        merged.extend(last_values_dict(layer));
    }
    merged
}

/// The `platform` value of a rewrapper config file, if any.
pub fn platform_from_cfg(cfg: &Path) -> Result<Option<String>, ConfigError> {
    Ok(read_config_file(cfg)?
        .remove("platform")
        .filter(|v| !v.is_empty()))
}

/// Render a merged platform as a `--platform=` flag value.
pub fn platform_flag_value(merged: &BTreeMap<String, String>) -> String {
    values_dict_to_config_value(merged)
}
