//! CLI command handlers.

pub mod check;
pub mod compile;
pub mod config;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use codepad_config::CodepadConfig;
use codepad_sandbox::SandboxOptions;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Explicit config directory, if one was given.
    pub config_dir: Option<PathBuf>,
    /// Merged configuration from all discovered layers.
    pub config: CodepadConfig,
}

/// Toolchain overrides shared by commands that load the toolchain.
#[derive(Args, Debug, Default, Clone)]
pub struct ToolchainFlags {
    /// Shared runtime artifact (path or URL), overrides [toolchain].shared_runtime
    #[arg(long)]
    pub shared_runtime: Option<String>,

    /// Compiler driver artifact (path or URL), overrides [toolchain].driver
    #[arg(long)]
    pub driver: Option<String>,

    /// Per-call execution limit in seconds, overrides [execution].timeout_secs
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl Context {
    /// Sandbox options from the merged config with CLI flags applied last.
    pub fn sandbox_options(&self, flags: &ToolchainFlags) -> Result<SandboxOptions> {
        let mut config = self.config.clone();

        let mut toolchain = config.toolchain();
        if let Some(shared) = &flags.shared_runtime {
            toolchain.shared_runtime = Some(shared.clone());
        }
        if let Some(driver) = &flags.driver {
            toolchain.driver = Some(driver.clone());
        }
        config.toolchain = Some(toolchain);

        if let Some(secs) = flags.timeout {
            let mut execution = config.execution();
            execution.timeout_secs = secs;
            config.execution = Some(execution);
        }

        SandboxOptions::from_config(&config).context(
            "invalid toolchain configuration (set [toolchain] shared_runtime and driver \
             in config.toml, or pass --shared-runtime and --driver)",
        )
    }
}
