//! Compile-and-run adapter for a prebuilt WebAssembly C++ toolchain.
//!
//! [`CppCompiler`] loads the toolchain's two artifacts, instantiates them
//! through a named [`RuntimeFactory`], and then serves compile and execute
//! calls one at a time. Each call writes into a private in-memory
//! filesystem ([`MemoryFs`]), captures the module's stdout and stderr, and
//! folds every outcome into a [`CompilationResult`].
//!
//! The built-in factory (`"wasi"`) hosts the toolchain with wasmtime. Tests
//! and embedders can register their own factories and fetchers.

pub mod capture;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod error;
pub mod loader;
pub mod module;
pub mod queue;
pub mod result;
pub mod runtime;
pub mod vfs;
pub mod wasm;

pub use capture::{
    CaptureScope, Captured, OutputSink, STDERR, STDOUT, SinkRef, StreamTable, TracingSink,
    capture,
};
pub use compiler::{CppCompiler, ToolchainInfo};
pub use config::{CompilerOptions, ExecutionLimits, SandboxOptions, ToolchainOptions};
pub use driver::{EXECUTABLE_PATH, OUTPUT_PATH, TMP_DIR, Toolchain, WORKSPACE_DIR};
pub use error::{FsError, SandboxError, SandboxResult};
pub use loader::{
    Artifact, ArtifactFetcher, ArtifactSource, ArtifactSpec, DRIVER_ID, DefaultFetcher,
    ModuleLoader, SHARED_RUNTIME_ID, ToolchainArtifacts,
};
pub use module::ToolchainModule;
pub use queue::CompileQueue;
pub use result::{CompilationResult, ExecutionOutput};
pub use runtime::{
    FactoryRegistry, Initialized, ReadyState, Readiness, RuntimeFactory, RuntimeInitializer,
};
pub use vfs::{MemoryFs, Metadata};
pub use wasm::{WASI_FACTORY, WasiFactory, WasiModule};
