//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [toolchain]              # where the wasm toolchain comes from
//! [compiler]               # compile flags, ready timeout, queue sizing
//! [execution]              # per-call limits
//! [logging]                # console/file log levels
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Maps to the full TOML config file. All sections are optional so that
/// partial configs (e.g., project-local overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodepadConfig {
    /// Toolchain artifact sources and host settings.
    pub toolchain: Option<ToolchainSection>,

    /// Compile driver settings.
    pub compiler: Option<CompilerSection>,

    /// Execution limits.
    pub execution: Option<ExecutionSection>,

    /// Logging configuration.
    pub logging: Option<LoggingSection>,
}

impl CodepadConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections replace whole; fields are not merged individually.
    pub fn merge(&mut self, other: CodepadConfig) {
        if other.toolchain.is_some() {
            self.toolchain = other.toolchain;
        }

        if other.compiler.is_some() {
            self.compiler = other.compiler;
        }

        if other.execution.is_some() {
            self.execution = other.execution;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// A config with every section populated with its defaults.
    ///
    /// Used by `codepad config init` to write a starter file.
    pub fn with_defaults() -> Self {
        Self {
            toolchain: Some(ToolchainSection::default()),
            compiler: Some(CompilerSection::default()),
            execution: Some(ExecutionSection::default()),
            logging: Some(LoggingSection::default()),
        }
    }

    /// Toolchain section, or defaults when absent.
    pub fn toolchain(&self) -> ToolchainSection {
        self.toolchain.clone().unwrap_or_default()
    }

    /// Compiler section, or defaults when absent.
    pub fn compiler(&self) -> CompilerSection {
        self.compiler.clone().unwrap_or_default()
    }

    /// Execution section, or defaults when absent.
    pub fn execution(&self) -> ExecutionSection {
        self.execution.clone().unwrap_or_default()
    }

    /// Logging section, or defaults when absent.
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Toolchain Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Where the prebuilt wasm toolchain is loaded from.
///
/// ```toml
/// [toolchain]
/// shared_runtime = "https://cdn.example.org/clang/17/shared.wasm"
/// driver = "https://cdn.example.org/clang/17/clang.wasm"
/// factory = "wasi"
/// entry = "_start"
/// shared_module = "env"
/// compiler = "clang++"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainSection {
    /// First artifact: the shared runtime the driver links against.
    /// Path, `file://` URL, or `http(s)://` URL.
    pub shared_runtime: Option<String>,
    /// Second artifact: the compiler driver.
    pub driver: Option<String>,
    /// Name of the registered runtime factory that instantiates the artifacts.
    pub factory: String,
    /// Export the driver must provide as its entry point.
    pub entry: String,
    /// Linker namespace under which the shared runtime's exports are visible.
    pub shared_module: String,
    /// Program name placed in `argv[0]` of compile invocations.
    pub compiler: String,
}

impl Default for ToolchainSection {
    fn default() -> Self {
        Self {
            shared_runtime: None,
            driver: None,
            factory: "wasi".to_string(),
            entry: "_start".to_string(),
            shared_module: "env".to_string(),
            compiler: "clang++".to_string(),
        }
    }
}

impl ToolchainSection {
    /// Both artifact sources, in load order.
    ///
    /// Fails with [`ConfigError::MissingField`] when either is unset.
    pub fn sources(&self) -> Result<(String, String)> {
        let shared = self
            .shared_runtime
            .clone()
            .ok_or_else(|| missing("shared_runtime"))?;
        let driver = self.driver.clone().ok_or_else(|| missing("driver"))?;
        Ok((shared, driver))
    }
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingField {
        field: field.to_string(),
        context: "[toolchain]".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiler Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Compile driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSection {
    /// Language standard passed as `-std=<std>`.
    pub std: String,
    /// Optimization flag, passed verbatim.
    pub opt_level: String,
    /// Source filename used when the caller does not name one.
    pub default_filename: String,
    /// How long a compile call waits for the toolchain to become ready.
    pub ready_timeout_secs: u64,
    /// Maximum number of queued compile/execute requests.
    pub queue_capacity: usize,
}

impl Default for CompilerSection {
    fn default() -> Self {
        Self {
            std: "c++17".to_string(),
            opt_level: "-O2".to_string(),
            default_filename: "main.cpp".to_string(),
            ready_timeout_secs: 30,
            queue_capacity: 32,
        }
    }
}

impl CompilerSection {
    /// Ready timeout as a [`Duration`].
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Reject values the compile driver cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "compiler.queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.default_filename.is_empty() || self.default_filename.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "compiler.default_filename".to_string(),
                reason: "must be a plain file name".to_string(),
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Limits applied to every entry-point call (compiler and user program).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Wall-clock budget, converted to wasm fuel.
    pub timeout_secs: u64,
    /// Captured stdout cap in bytes.
    pub stdout_limit_bytes: usize,
    /// Captured stderr cap in bytes.
    pub stderr_limit_bytes: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            stdout_limit_bytes: 1024 * 1024,
            stderr_limit_bytes: 256 * 1024,
        }
    }
}

impl ExecutionSection {
    /// Execution timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Log level settings for the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Console log level (an `EnvFilter` directive).
    pub level: String,
    /// Whether to also write a daily-rotated JSON log file.
    pub json_file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_parses() {
        let config = CodepadConfig::from_toml("").unwrap();
        assert!(config.toolchain.is_none());
        assert_eq!(config.compiler(), CompilerSection::default());
    }

    #[test]
    fn test_parse_toolchain_section() {
        let config = CodepadConfig::from_toml(
            r#"
[toolchain]
shared_runtime = "/opt/clang/shared.wasm"
driver = "https://cdn.example.org/clang.wasm"
"#,
        )
        .unwrap();

        let toolchain = config.toolchain();
        assert_eq!(toolchain.factory, "wasi");
        assert_eq!(toolchain.entry, "_start");
        let (shared, driver) = toolchain.sources().unwrap();
        assert_eq!(shared, "/opt/clang/shared.wasm");
        assert_eq!(driver, "https://cdn.example.org/clang.wasm");
    }

    #[test]
    fn test_sources_missing_driver() {
        let toolchain = ToolchainSection {
            shared_runtime: Some("a.wasm".into()),
            ..Default::default()
        };
        let err = toolchain.sources().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field, .. } if field == "driver"));
    }

    #[test]
    fn test_merge_overrides_whole_sections() {
        let mut base = CodepadConfig::with_defaults();
        let overlay = CodepadConfig::from_toml(
            r#"
[compiler]
std = "c++20"
"#,
        )
        .unwrap();

        base.merge(overlay);
        let compiler = base.compiler();
        assert_eq!(compiler.std, "c++20");
        // Unspecified fields in the overriding section fall back to defaults.
        assert_eq!(compiler.opt_level, "-O2");
        assert!(base.execution.is_some());
    }

    #[test]
    fn test_roundtrip_defaults() {
        let config = CodepadConfig::with_defaults();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[compiler]"));
        let parsed = CodepadConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let compiler = CompilerSection {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(compiler.validate().is_err());
        assert!(CompilerSection::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_path_filename() {
        let compiler = CompilerSection {
            default_filename: "src/main.cpp".into(),
            ..Default::default()
        };
        assert!(matches!(
            compiler.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_durations() {
        assert_eq!(CompilerSection::default().ready_timeout(), Duration::from_secs(30));
        assert_eq!(ExecutionSection::default().timeout(), Duration::from_secs(10));
    }
}
