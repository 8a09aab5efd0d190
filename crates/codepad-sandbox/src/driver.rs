//! Compile and execute drivers over a [`ToolchainModule`].
//!
//! # Flow
//!
//! 1. Workspace and `/tmp` are emptied
//! 2. Source is written to `/workspace/<filename>`
//! 3. The compiler entry point runs with a fixed argv, streams captured
//! 4. On exit 0, `/workspace/output` is read back
//! 5. The output is copied to `/workspace/program`, marked executable, and run
//!
//! Every failure along the way ends up in the returned result; nothing here
//! returns an error or lets a panic escape.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use tracing::{debug, warn};

use crate::capture::{Captured, capture};
use crate::config::CompilerOptions;
use crate::error::{FsError, SandboxError, SandboxResult};
use crate::module::ToolchainModule;
use crate::result::{CompilationResult, ExecutionOutput};
use crate::vfs::join;

/// Scratch directory for compiler temporaries.
pub const TMP_DIR: &str = "/tmp";

/// Per-call workspace holding the source, output and program.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Where the compiler is told to write its output.
pub const OUTPUT_PATH: &str = "/workspace/output";

/// Where the program is placed before it runs.
pub const EXECUTABLE_PATH: &str = "/workspace/program";

/// Directories emptied before every compile.
const SCRATCH_DIRS: [&str; 2] = [WORKSPACE_DIR, TMP_DIR];

/// Permission bits given to the program before it runs.
const EXECUTABLE_MODE: u32 = 0o755;

/// Drives one module through compile and execute calls.
pub struct Toolchain {
    module: Box<dyn ToolchainModule>,
    compiler: String,
    options: CompilerOptions,
}

impl Toolchain {
    /// Wrap a module. `compiler` is used as `argv[0]` for compile calls.
    pub fn new(
        module: Box<dyn ToolchainModule>,
        compiler: impl Into<String>,
        options: CompilerOptions,
    ) -> Self {
        Self {
            module,
            compiler: compiler.into(),
            options,
        }
    }

    /// The wrapped module.
    pub fn module(&self) -> &dyn ToolchainModule {
        self.module.as_ref()
    }

    /// Argument vector for compiling `source_path`.
    pub fn compile_argv(&self, source_path: &str) -> Vec<String> {
        vec![
            self.compiler.clone(),
            format!("-std={}", self.options.std),
            self.options.opt_level.clone(),
            "-o".to_string(),
            OUTPUT_PATH.to_string(),
            source_path.to_string(),
        ]
    }

    /// Compile `source` as `filename`, then run the result.
    pub fn compile(&mut self, source: &str, filename: &str) -> CompilationResult {
        self.compile_with(source, filename, true)
    }

    /// Compile without running. Execution fields stay empty.
    pub fn build(&mut self, source: &str, filename: &str) -> CompilationResult {
        self.compile_with(source, filename, false)
    }

    fn compile_with(&mut self, source: &str, filename: &str, run: bool) -> CompilationResult {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_compile(source, filename, run)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => CompilationResult::failure(e.to_string()),
            Err(panic) => CompilationResult::failure(panic_message(panic)),
        };
        debug!(
            filename,
            success = result.success,
            has_executable = result.has_executable(),
            elapsed = ?start.elapsed(),
            "Compile finished"
        );
        result
    }

    /// Run a compiled program.
    pub fn execute(&mut self, executable: &[u8]) -> ExecutionOutput {
        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.try_execute(executable)));
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ExecutionOutput::aborted(e.to_string()),
            Err(panic) => ExecutionOutput::aborted(panic_message(panic)),
        };
        debug!(exit_code = ?output.exit_code, elapsed = ?start.elapsed(), "Execution finished");
        output
    }

    /// Remove every entry under the workspace and under `/tmp`, so compiler
    /// temporaries do not outlive the call. Listing failures are ignored.
    pub fn clean_workspace(&mut self) {
        for dir in SCRATCH_DIRS {
            self.clean_dir(dir);
        }
    }

    fn clean_dir(&mut self, dir: &str) {
        let fs = self.module.fs_mut();
        let entries = match fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir, error = %e, "Directory not listable, nothing to clean");
                return;
            }
        };
        for name in entries.iter().filter(|n| *n != "." && *n != "..") {
            let path = join(dir, name);
            if let Err(e) = fs.remove_all(&path) {
                warn!(path = %path, error = %e, "Failed to remove scratch entry");
            }
        }
    }

    fn try_compile(
        &mut self,
        source: &str,
        filename: &str,
        run: bool,
    ) -> SandboxResult<CompilationResult> {
        validate_filename(filename)?;
        self.clean_workspace();

        let source_path = join(WORKSPACE_DIR, filename);
        self.module.fs_mut().write_file(&source_path, source)?;

        let argv = self.compile_argv(&source_path);
        let (exit_code, captured) = self.invoke(&argv)?;
        if exit_code != 0 {
            debug!(exit_code, "Compiler rejected source");
            return Ok(CompilationResult::rejected(exit_code, captured));
        }

        match self.read_output() {
            Ok(executable) if run => {
                let output = self.execute(&executable);
                Ok(CompilationResult::compiled(&captured, executable, output))
            }
            Ok(executable) => Ok(CompilationResult::built(&captured, executable)),
            Err(e) => {
                warn!(error = %e, "Compiler succeeded but output is unusable");
                Ok(CompilationResult::unreadable(&captured, e.to_string()))
            }
        }
    }

    fn try_execute(&mut self, executable: &[u8]) -> SandboxResult<ExecutionOutput> {
        let fs = self.module.fs_mut();
        fs.create_dir_all(WORKSPACE_DIR)?;
        fs.write_file(EXECUTABLE_PATH, executable)?;
        fs.chmod(EXECUTABLE_PATH, EXECUTABLE_MODE)?;

        let (exit_code, captured) = self.invoke(&[EXECUTABLE_PATH.to_string()])?;
        Ok(ExecutionOutput::exited(exit_code, captured))
    }

    fn read_output(&self) -> SandboxResult<Vec<u8>> {
        let bytes = self
            .module
            .fs()
            .read_file(OUTPUT_PATH)
            .map_err(|source| SandboxError::ArtifactRead {
                path: OUTPUT_PATH.to_string(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(SandboxError::CompilationFailure(format!(
                "compiler produced an empty {OUTPUT_PATH}"
            )));
        }
        Ok(bytes)
    }

    /// Call the entry point with both streams captured.
    fn invoke(&mut self, argv: &[String]) -> SandboxResult<(i32, Captured)> {
        let streams = self.module.streams();
        let module = &mut self.module;
        let (exit_code, captured) = capture(&streams, || module.call_main(argv));
        let exit_code = exit_code?;
        Ok((exit_code, captured))
    }
}

/// Reject names that would escape the workspace or are not a single file.
fn validate_filename(filename: &str) -> SandboxResult<()> {
    if filename.is_empty() || filename == "." || filename == ".." || filename.contains('/') {
        return Err(FsError::InvalidPath(filename.to_string()).into());
    }
    Ok(())
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Toolchain panicked: {detail}")
}
