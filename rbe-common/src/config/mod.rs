//! Configuration for remote actions.
//!
//! - Environment variable parsing with type safety and source tracking
//! - rewrapper/reproxy `key=value` config files
//! - A one-time environment snapshot injected into the orchestrator

pub mod cfg_file;
pub mod env;
pub mod rbe_env;
pub mod source;

pub use cfg_file::{ConfigError, read_config_file, read_config_file_lines};
pub use env::{EnvError, EnvParser};
pub use rbe_env::RbeEnvironment;
pub use source::{ConfigSource, Sourced};
