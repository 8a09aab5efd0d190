//! Runtime options for the compiler adapter.
//!
//! Built from [`codepad_config::CodepadConfig`] by the CLI, or directly with
//! the builder methods in tests and embedders.

use std::time::Duration;

use codepad_config::{CodepadConfig, ConfigError};

/// Where the toolchain comes from and how it is entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainOptions {
    /// Shared runtime source (loaded first).
    pub shared_runtime: String,
    /// Compiler driver source (loaded second).
    pub driver: String,
    /// Registered [`RuntimeFactory`](crate::RuntimeFactory) name.
    pub factory: String,
    /// Entry export of the driver.
    pub entry: String,
    /// Linker namespace for the shared runtime.
    pub shared_module: String,
    /// `argv[0]` of compile invocations.
    pub compiler: String,
}

impl ToolchainOptions {
    /// Options for the given artifact sources with default factory settings.
    pub fn new(shared_runtime: impl Into<String>, driver: impl Into<String>) -> Self {
        let defaults = codepad_config::ToolchainSection::default();
        Self {
            shared_runtime: shared_runtime.into(),
            driver: driver.into(),
            factory: defaults.factory,
            entry: defaults.entry,
            shared_module: defaults.shared_module,
            compiler: defaults.compiler,
        }
    }

    /// Select a different runtime factory.
    pub fn with_factory(mut self, factory: impl Into<String>) -> Self {
        self.factory = factory.into();
        self
    }

    /// Set the compiler program name.
    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }
}

/// Compile driver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Language standard, passed as `-std=<std>`.
    pub std: String,
    /// Optimization flag.
    pub opt_level: String,
    /// Filename used by [`CppCompiler::compile`](crate::CppCompiler::compile).
    pub default_filename: String,
    /// Bounded wait for readiness per call.
    pub ready_timeout: Duration,
    /// Maximum queued requests.
    pub queue_capacity: usize,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        let defaults = codepad_config::CompilerSection::default();
        Self {
            ready_timeout: defaults.ready_timeout(),
            std: defaults.std,
            opt_level: defaults.opt_level,
            default_filename: defaults.default_filename,
            queue_capacity: defaults.queue_capacity,
        }
    }
}

impl CompilerOptions {
    /// Set the ready timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Limits applied to each entry-point call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        let defaults = codepad_config::ExecutionSection::default();
        Self {
            timeout: defaults.timeout(),
            stdout_limit: defaults.stdout_limit_bytes,
            stderr_limit: defaults.stderr_limit_bytes,
        }
    }
}

/// Everything a [`CppCompiler`](crate::CppCompiler) needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    pub toolchain: ToolchainOptions,
    pub compiler: CompilerOptions,
    pub execution: ExecutionLimits,
}

impl SandboxOptions {
    /// Options with defaults for everything but the artifact sources.
    pub fn new(toolchain: ToolchainOptions) -> Self {
        Self {
            toolchain,
            compiler: CompilerOptions::default(),
            execution: ExecutionLimits::default(),
        }
    }

    /// Replace the compiler options.
    pub fn with_compiler(mut self, compiler: CompilerOptions) -> Self {
        self.compiler = compiler;
        self
    }

    /// Replace the execution limits.
    pub fn with_execution(mut self, execution: ExecutionLimits) -> Self {
        self.execution = execution;
        self
    }

    /// Build options from a loaded config.
    ///
    /// Fails when the toolchain sources are missing or compiler settings are invalid.
    pub fn from_config(config: &CodepadConfig) -> Result<Self, ConfigError> {
        let toolchain = config.toolchain();
        let (shared_runtime, driver) = toolchain.sources()?;
        let compiler = config.compiler();
        compiler.validate()?;
        let execution = config.execution();

        Ok(Self {
            toolchain: ToolchainOptions {
                shared_runtime,
                driver,
                factory: toolchain.factory,
                entry: toolchain.entry,
                shared_module: toolchain.shared_module,
                compiler: toolchain.compiler,
            },
            compiler: CompilerOptions {
                ready_timeout: compiler.ready_timeout(),
                std: compiler.std,
                opt_level: compiler.opt_level,
                default_filename: compiler.default_filename,
                queue_capacity: compiler.queue_capacity,
            },
            execution: ExecutionLimits {
                timeout: execution.timeout(),
                stdout_limit: execution.stdout_limit_bytes,
                stderr_limit: execution.stderr_limit_bytes,
            },
        })
    }
}
