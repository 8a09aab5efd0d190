//! Configuration system for the Codepad compile-and-run sandbox.
//!
//! Provides TOML-based configuration with:
//! - Toolchain artifact sources (`[toolchain]`)
//! - Compiler flags, ready timeout and queue sizing (`[compiler]`)
//! - Execution limits (`[execution]`)
//! - Log levels (`[logging]`)
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
