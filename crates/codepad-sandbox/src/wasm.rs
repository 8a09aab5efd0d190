//! Wasmtime-backed toolchain module.
//!
//! The shared runtime and compiler driver are WASI Preview 1 modules. Each
//! entry-point call gets a fresh store: the module's [`MemoryFs`] scratch
//! directories are mirrored into a host temp dir, preopened, and copied back
//! once the call returns. Output goes through bounded memory pipes and is
//! then forwarded to whatever handlers the stream table holds.
//!
//! Programs built by the driver run the same way, looked up by path in the
//! virtual filesystem and cached by SHA-256 of their bytes.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::capture::{STDERR, STDOUT, StreamTable};
use crate::config::{ExecutionLimits, SandboxOptions};
use crate::driver::{TMP_DIR, WORKSPACE_DIR};
use crate::error::{SandboxError, SandboxResult};
use crate::loader::{ToolchainArtifacts, sha256_hex};
use crate::module::ToolchainModule;
use crate::runtime::RuntimeFactory;
use crate::vfs::MemoryFs;

/// Registry name of [`WasiFactory`].
pub const WASI_FACTORY: &str = "wasi";

/// Roughly 33M instructions per second of allowed wall time.
const FUEL_PER_SEC: u64 = 33_000_000;

/// Compiled programs kept before the cache is reset.
const PROGRAM_CACHE_LIMIT: usize = 32;

/// Directories mirrored into every call.
const MIRRORED_DIRS: [&str; 2] = [TMP_DIR, WORKSPACE_DIR];

/// Instantiates the toolchain with wasmtime and WASI Preview 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasiFactory;

#[async_trait]
impl RuntimeFactory for WasiFactory {
    async fn instantiate(
        &self,
        artifacts: &ToolchainArtifacts,
        options: &SandboxOptions,
    ) -> SandboxResult<Box<dyn ToolchainModule>> {
        let artifacts = artifacts.clone();
        let options = options.clone();

        // Cranelift compilation of the driver is slow and synchronous.
        let module = tokio::task::spawn_blocking(move || WasiModule::new(&artifacts, &options))
            .await
            .map_err(|e| unavailable(format!("module compilation task failed: {e}")))??;
        Ok(Box::new(module))
    }
}

fn unavailable(reason: String) -> SandboxError {
    SandboxError::RuntimeUnavailable {
        factory: WASI_FACTORY.to_string(),
        reason,
    }
}

/// A compiled toolchain plus its virtual filesystem and stream slots.
pub struct WasiModule {
    engine: Engine,
    shared: Module,
    driver: Module,
    shared_module: String,
    entry: String,
    compiler: String,
    limits: ExecutionLimits,
    fs: MemoryFs,
    streams: Arc<StreamTable>,
    /// SHA-256 hex of program bytes -> compiled module.
    program_cache: HashMap<String, Module>,
}

impl WasiModule {
    /// Compile both artifacts. The driver must export the configured entry.
    pub fn new(artifacts: &ToolchainArtifacts, options: &SandboxOptions) -> SandboxResult<Self> {
        let start = Instant::now();
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|e| unavailable(format!("failed to create wasmtime engine: {e}")))?;

        let shared = Module::new(&engine, &artifacts.shared_runtime.bytes)
            .map_err(|e| unavailable(format!("shared runtime is not a valid module: {e}")))?;
        let driver = Module::new(&engine, &artifacts.driver.bytes)
            .map_err(|e| unavailable(format!("driver is not a valid module: {e}")))?;

        let toolchain = &options.toolchain;
        let exports_entry = driver
            .get_export(&toolchain.entry)
            .is_some_and(|export| export.func().is_some());
        if !exports_entry {
            return Err(unavailable(format!(
                "driver does not export function '{}'",
                toolchain.entry
            )));
        }

        debug!(
            shared = %artifacts.shared_runtime.sha256,
            driver = %artifacts.driver.sha256,
            elapsed = ?start.elapsed(),
            "Compiled toolchain modules"
        );

        Ok(Self {
            engine,
            shared,
            driver,
            shared_module: toolchain.shared_module.clone(),
            entry: toolchain.entry.clone(),
            compiler: toolchain.compiler.clone(),
            limits: options.execution.clone(),
            fs: MemoryFs::new(),
            streams: Arc::new(StreamTable::new()),
            program_cache: HashMap::new(),
        })
    }

    /// Look up (or compile and cache) the program module for `bytes`.
    fn program(&mut self, bytes: &[u8]) -> SandboxResult<Module> {
        let hash = sha256_hex(bytes);
        if let Some(module) = self.program_cache.get(&hash) {
            debug!(hash = %hash, "Program cache hit");
            return Ok(module.clone());
        }
        let module = Module::new(&self.engine, bytes).map_err(|e| {
            SandboxError::ExecutionFailure(format!("program is not a valid module: {e}"))
        })?;
        if self.program_cache.len() >= PROGRAM_CACHE_LIMIT {
            self.program_cache.clear();
        }
        self.program_cache.insert(hash, module.clone());
        Ok(module)
    }

    /// Run `module`'s entry point in a fresh store.
    fn run(&mut self, module: &Module, argv: &[String]) -> SandboxResult<i32> {
        let host = tempfile::TempDir::new()?;
        for dir in MIRRORED_DIRS {
            materialize(&self.fs, dir, host.path())?;
        }

        let stdout_pipe = MemoryOutputPipe::new(self.limits.stdout_limit);
        let stderr_pipe = MemoryOutputPipe::new(self.limits.stderr_limit);

        let mut builder = WasiCtxBuilder::new();
        builder
            .args(argv)
            .stdout(stdout_pipe.clone())
            .stderr(stderr_pipe.clone());
        for dir in MIRRORED_DIRS {
            builder
                .preopened_dir(host_path(host.path(), dir), dir, DirPerms::all(), FilePerms::all())
                .map_err(|e| {
                    SandboxError::ExecutionFailure(format!("failed to preopen {dir}: {e}"))
                })?;
        }
        let mut store = Store::new(&self.engine, builder.build_p1());

        store
            .set_fuel(fuel_budget(self.limits.timeout))
            .map_err(|e| SandboxError::ExecutionFailure(format!("failed to set fuel: {e}")))?;

        let outcome = self.call_entry(&mut store, module);

        // Whatever the program wrote before trapping is still reported.
        self.streams.write(STDOUT, &stdout_pipe.contents());
        self.streams.write(STDERR, &stderr_pipe.contents());
        for dir in MIRRORED_DIRS {
            sync_back(&mut self.fs, dir, host.path())?;
        }

        outcome
    }

    fn call_entry(&self, store: &mut Store<WasiP1Ctx>, module: &Module) -> SandboxResult<i32> {
        let mut linker: Linker<WasiP1Ctx> = Linker::new(&self.engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |ctx: &mut WasiP1Ctx| ctx)
            .map_err(|e| SandboxError::ExecutionFailure(format!("failed to link WASI: {e}")))?;

        let needs_shared = module
            .imports()
            .any(|import| import.module() == self.shared_module);
        if needs_shared {
            linker
                .module(&mut *store, &self.shared_module, &self.shared)
                .map_err(|e| {
                    SandboxError::ExecutionFailure(format!("failed to link shared runtime: {e}"))
                })?;
        }

        let instance = linker.instantiate(&mut *store, module).map_err(|e| {
            SandboxError::ExecutionFailure(format!("failed to instantiate module: {e}"))
        })?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut *store, &self.entry)
            .map_err(|e| {
                SandboxError::ExecutionFailure(format!("no '{}' entry point: {e}", self.entry))
            })?;

        match entry.call(&mut *store, ()) {
            Ok(()) => Ok(0),
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    return Ok(exit.0);
                }
                if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
                    return Err(SandboxError::ExecutionFailure(
                        "execution timed out (fuel exhausted)".to_string(),
                    ));
                }
                Err(SandboxError::ExecutionFailure(format!("WASM execution error: {e}")))
            }
        }
    }
}

impl ToolchainModule for WasiModule {
    fn fs(&self) -> &MemoryFs {
        &self.fs
    }

    fn fs_mut(&mut self) -> &mut MemoryFs {
        &mut self.fs
    }

    fn streams(&self) -> Arc<StreamTable> {
        self.streams.clone()
    }

    fn call_main(&mut self, argv: &[String]) -> SandboxResult<i32> {
        let Some(program) = argv.first() else {
            return Err(SandboxError::ExecutionFailure("empty argv".to_string()));
        };

        if *program == self.compiler {
            let driver = self.driver.clone();
            return self.run(&driver, argv);
        }

        let metadata = match self.fs.metadata(program) {
            Ok(metadata) if !metadata.is_dir => metadata,
            _ => {
                self.streams
                    .write(STDERR, format!("{program}: command not found\n").as_bytes());
                return Ok(127);
            }
        };
        if !metadata.is_executable() {
            self.streams
                .write(STDERR, format!("{program}: permission denied\n").as_bytes());
            return Ok(126);
        }

        let bytes = self.fs.read_file(program)?;
        let module = self.program(&bytes)?;
        self.run(&module, argv)
    }
}

/// Fuel allowed for one call. Sub-second timeouts still get a full second.
fn fuel_budget(timeout: Duration) -> u64 {
    FUEL_PER_SEC.saturating_mul(timeout.as_secs().max(1))
}

fn host_path(root: &Path, guest: &str) -> std::path::PathBuf {
    root.join(guest.trim_start_matches('/'))
}

/// Copy `dir` and everything under it from the virtual filesystem to `root`.
fn materialize(fs: &MemoryFs, dir: &str, root: &Path) -> SandboxResult<()> {
    std::fs::create_dir_all(host_path(root, dir))?;
    for (path, metadata) in fs.walk(dir)? {
        let target = host_path(root, &path);
        if metadata.is_dir {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::write(&target, fs.read_file(&path)?)?;
        }
    }
    Ok(())
}

/// Make the virtual `dir` match its host mirror under `root`.
///
/// Entries the call deleted are removed; existing files keep their mode.
fn sync_back(fs: &mut MemoryFs, dir: &str, root: &Path) -> SandboxResult<()> {
    let mut seen = BTreeSet::new();
    collect_host(fs, dir, &host_path(root, dir), &mut seen)?;

    let stale: Vec<String> = fs
        .walk(dir)?
        .into_iter()
        .map(|(path, _)| path)
        .filter(|path| !seen.contains(path))
        .collect();
    for path in stale {
        // A removed directory takes its children with it.
        if fs.exists(&path)
            && let Err(e) = fs.remove_all(&path)
        {
            warn!(path = %path, error = %e, "Failed to drop deleted entry");
        }
    }
    Ok(())
}

fn collect_host(
    fs: &mut MemoryFs,
    guest_dir: &str,
    host_dir: &Path,
    seen: &mut BTreeSet<String>,
) -> SandboxResult<()> {
    fs.create_dir_all(guest_dir)?;
    for entry in std::fs::read_dir(host_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let guest = crate::vfs::join(guest_dir, &name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_host(fs, &guest, &entry.path(), seen)?;
        } else if file_type.is_file() {
            let data = std::fs::read(entry.path())?;
            let unchanged = fs.read_file(&guest).is_ok_and(|old| old == data);
            if !unchanged {
                if fs.metadata(&guest).is_ok_and(|m| m.is_dir) {
                    fs.remove_all(&guest)?;
                }
                fs.write_file(&guest, data)?;
            }
        }
        seen.insert(guest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::capture;
    use crate::config::{CompilerOptions, ToolchainOptions};
    use crate::driver::{EXECUTABLE_PATH, Toolchain};
    use crate::loader::{Artifact, ArtifactSource, DRIVER_ID, SHARED_RUNTIME_ID};
    use crate::runtime::provision_workspace;

    const EMPTY_SHARED: &str = "(module)";

    /// Instantiating this runtime traps, so linking it fails any call.
    const TRAPPING_SHARED: &str = "(module (func $boom unreachable) (start $boom))";

    const ANSWER_SHARED: &str = r#"(module (func (export "answer") (result i32) (i32.const 42)))"#;

    const EXIT_3: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
          (memory (export "memory") 1)
          (func (export "_start") (call $exit (i32.const 3))))"#;

    const EXIT_7: &str = r#"(module (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32))) (memory (export "memory") 1) (func (export "_start") (call $exit (i32.const 7))))"#;

    const EXIT_WITH_ANSWER: &str = r#"
        (module
          (import "env" "answer" (func $answer (result i32)))
          (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
          (memory (export "memory") 1)
          (func (export "_start") (call $exit (call $answer))))"#;

    const SPIN: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "_start") (loop $spin (br $spin))))"#;

    const WRITE_THEN_TRAP: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 0) "\08\00\00\00\08\00\00\00")
          (data (i32.const 8) "partial\0a")
          (func (export "_start")
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 16)))
            unreachable))"#;

    /// A driver that writes `program` to `output` in the second preopen
    /// (`/workspace`), the way the real compiler emits its result.
    fn emitting_driver(program: &str) -> String {
        format!(
            r#"(module
              (import "wasi_snapshot_preview1" "path_open"
                (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
              (import "wasi_snapshot_preview1" "fd_close"
                (func $fd_close (param i32) (result i32)))
              (memory (export "memory") 1)
              (data (i32.const 16) "output")
              (data (i32.const 64) "{escaped}")
              (func (export "_start")
                (local $fd i32)
                (if (call $path_open (i32.const 4) (i32.const 0) (i32.const 16) (i32.const 6)
                      (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 0))
                  (then unreachable))
                (local.set $fd (i32.load (i32.const 0)))
                (i32.store (i32.const 4) (i32.const 64))
                (i32.store (i32.const 8) (i32.const {len}))
                (drop (call $fd_write (local.get $fd) (i32.const 4) (i32.const 1) (i32.const 12)))
                (drop (call $fd_close (local.get $fd)))))"#,
            escaped = program.replace('"', "\\\""),
            len = program.len(),
        )
    }

    fn artifact(id: &str, text: &str) -> Arc<Artifact> {
        Arc::new(Artifact {
            id: id.to_string(),
            source: ArtifactSource::parse(&format!("mem://{id}.wat")),
            bytes: text.as_bytes().to_vec(),
            sha256: sha256_hex(text.as_bytes()),
        })
    }

    fn wasi_module(shared: &str, driver: &str, timeout: Duration) -> WasiModule {
        let artifacts = ToolchainArtifacts {
            shared_runtime: artifact(SHARED_RUNTIME_ID, shared),
            driver: artifact(DRIVER_ID, driver),
        };
        let options = SandboxOptions::new(ToolchainOptions::new(
            "mem://shared-runtime.wat",
            "mem://driver.wat",
        ))
        .with_execution(ExecutionLimits {
            timeout,
            ..Default::default()
        });
        let mut module = WasiModule::new(&artifacts, &options).unwrap();
        provision_workspace(&mut module).unwrap();
        module
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_driver_without_entry_is_rejected() {
        let artifacts = ToolchainArtifacts {
            shared_runtime: artifact(SHARED_RUNTIME_ID, EMPTY_SHARED),
            driver: artifact(DRIVER_ID, "(module (memory (export \"memory\") 1))"),
        };
        let options = SandboxOptions::new(ToolchainOptions::new("a", "b"));
        let err = WasiModule::new(&artifacts, &options).err().unwrap();
        assert!(err.to_string().contains("does not export function '_start'"));
    }

    #[test]
    fn test_proc_exit_code_is_returned() {
        let mut module = wasi_module(EMPTY_SHARED, EXIT_3, Duration::from_secs(5));
        assert_eq!(module.call_main(&argv(&["clang++"])).unwrap(), 3);
    }

    #[test]
    fn test_shared_runtime_linked_only_when_imported() {
        let mut module = wasi_module(TRAPPING_SHARED, EXIT_3, Duration::from_secs(5));
        assert_eq!(module.call_main(&argv(&["clang++"])).unwrap(), 3);

        let mut module = wasi_module(ANSWER_SHARED, EXIT_WITH_ANSWER, Duration::from_secs(5));
        assert_eq!(module.call_main(&argv(&["clang++"])).unwrap(), 42);

        let mut module = wasi_module(TRAPPING_SHARED, EXIT_WITH_ANSWER, Duration::from_secs(5));
        let err = module.call_main(&argv(&["clang++"])).unwrap_err();
        assert!(err.to_string().contains("failed to link shared runtime"), "{err}");
    }

    #[test]
    fn test_fuel_exhaustion_reports_timeout() {
        let mut module = wasi_module(EMPTY_SHARED, SPIN, Duration::from_secs(1));
        let err = module.call_main(&argv(&["clang++"])).unwrap_err();
        assert!(
            err.to_string().contains("execution timed out (fuel exhausted)"),
            "{err}"
        );
    }

    #[test]
    fn test_output_forwarded_after_trap() {
        let mut module = wasi_module(EMPTY_SHARED, WRITE_THEN_TRAP, Duration::from_secs(5));
        let streams = module.streams();

        let (result, captured) = capture(&streams, || module.call_main(&argv(&["clang++"])));

        let err = result.unwrap_err();
        assert!(err.to_string().contains("WASM execution error"), "{err}");
        assert_eq!(captured.stdout, "partial\n");
    }

    #[test]
    fn test_missing_program_is_command_not_found() {
        let mut module = wasi_module(EMPTY_SHARED, EXIT_3, Duration::from_secs(5));
        let streams = module.streams();

        let (code, captured) = capture(&streams, || module.call_main(&argv(&[EXECUTABLE_PATH])));

        assert_eq!(code.unwrap(), 127);
        assert_eq!(captured.stderr, "/workspace/program: command not found\n");
    }

    #[test]
    fn test_non_executable_program_is_permission_denied() {
        let mut module = wasi_module(EMPTY_SHARED, EXIT_3, Duration::from_secs(5));
        module.fs_mut().write_file(EXECUTABLE_PATH, EXIT_7).unwrap();
        let streams = module.streams();

        let (code, captured) = capture(&streams, || module.call_main(&argv(&[EXECUTABLE_PATH])));

        assert_eq!(code.unwrap(), 126);
        assert!(captured.stderr.contains("permission denied"));
    }

    #[test]
    fn test_program_cache_reuses_compiled_module() {
        let mut module = wasi_module(EMPTY_SHARED, EXIT_3, Duration::from_secs(5));
        let fs = module.fs_mut();
        fs.write_file(EXECUTABLE_PATH, EXIT_7).unwrap();
        fs.chmod(EXECUTABLE_PATH, 0o755).unwrap();

        assert_eq!(module.call_main(&argv(&[EXECUTABLE_PATH])).unwrap(), 7);
        assert_eq!(module.call_main(&argv(&[EXECUTABLE_PATH])).unwrap(), 7);
        assert_eq!(module.program_cache.len(), 1);

        module.fs_mut().write_file(EXECUTABLE_PATH, EXIT_3).unwrap();
        assert_eq!(module.call_main(&argv(&[EXECUTABLE_PATH])).unwrap(), 3);
        assert_eq!(module.program_cache.len(), 2);
    }

    #[test]
    fn test_compile_and_run_through_preopens() {
        let module = wasi_module(EMPTY_SHARED, &emitting_driver(EXIT_7), Duration::from_secs(5));
        let mut toolchain = Toolchain::new(Box::new(module), "clang++", CompilerOptions::default());

        let result = toolchain.compile("int main() { return 7; }", "main.cpp");

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.executable.as_deref(), Some(EXIT_7.as_bytes()));
        assert_eq!(result.execution_output.as_deref(), Some(""));
        assert_eq!(
            result.execution_error.as_deref(),
            Some("Program exited with code 7")
        );
    }

    #[test]
    fn test_fuel_budget_saturates() {
        assert_eq!(fuel_budget(Duration::from_millis(10)), FUEL_PER_SEC);
        assert_eq!(fuel_budget(Duration::from_secs(2)), 2 * FUEL_PER_SEC);
        assert_eq!(fuel_budget(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_materialize_and_sync_round_trip() {
        let mut fs = MemoryFs::new();
        fs.create_dir_all("/workspace/sub").unwrap();
        fs.write_file("/workspace/main.cpp", "int main() {}").unwrap();
        fs.write_file("/workspace/sub/keep.txt", "keep").unwrap();
        fs.write_file("/workspace/gone.txt", "gone").unwrap();
        fs.chmod("/workspace/main.cpp", 0o600).unwrap();

        let host = tempfile::TempDir::new().unwrap();
        materialize(&fs, WORKSPACE_DIR, host.path()).unwrap();
        let mirror = host.path().join("workspace");
        assert_eq!(
            std::fs::read_to_string(mirror.join("sub/keep.txt")).unwrap(),
            "keep"
        );

        // Simulate what a compiler run does to the mirror.
        std::fs::remove_file(mirror.join("gone.txt")).unwrap();
        std::fs::write(mirror.join("output"), b"\0asm").unwrap();
        std::fs::write(mirror.join("main.cpp"), "int main() { return 0; }").unwrap();

        sync_back(&mut fs, WORKSPACE_DIR, host.path()).unwrap();

        assert!(!fs.exists("/workspace/gone.txt"));
        assert_eq!(fs.read_file("/workspace/output").unwrap(), b"\0asm");
        assert_eq!(fs.read_file("/workspace/sub/keep.txt").unwrap(), b"keep");
        let main = fs.metadata("/workspace/main.cpp").unwrap();
        assert_eq!(main.mode, 0o600);
        assert_eq!(
            fs.read_file("/workspace/main.cpp").unwrap(),
            b"int main() { return 0; }"
        );
    }

    #[test]
    fn test_sync_back_removes_deleted_directories() {
        let mut fs = MemoryFs::new();
        fs.create_dir_all("/tmp/cache/deep").unwrap();
        fs.write_file("/tmp/cache/deep/obj.o", "o").unwrap();

        let host = tempfile::TempDir::new().unwrap();
        materialize(&fs, TMP_DIR, host.path()).unwrap();
        std::fs::remove_dir_all(host.path().join("tmp/cache")).unwrap();

        sync_back(&mut fs, TMP_DIR, host.path()).unwrap();
        assert!(!fs.exists("/tmp/cache"));
        assert!(fs.exists("/tmp"));
    }

    #[test]
    fn test_host_path_strips_root() {
        let root = Path::new("/scratch");
        assert_eq!(host_path(root, "/workspace"), Path::new("/scratch/workspace"));
    }
}
