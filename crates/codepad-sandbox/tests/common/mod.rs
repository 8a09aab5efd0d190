//! Scripted stand-in for the WebAssembly C++ toolchain.
//!
//! The "compiler" accepts a tiny subset of C++: braces and parentheses must
//! balance and a `main(` must appear. It understands `puts("...")` and the
//! first `return N;`. Its "executables" are text files starting with
//! `FAKEEXE` that the module interprets when run.
//!
//! Magic markers in the source trigger failure modes:
//! - `#error_internal` makes the entry point return an error
//! - `#panic` makes it panic
//! - `#no_output` exits zero without writing an output file

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use codepad_sandbox::{
    ArtifactFetcher, ArtifactSource, CompilerOptions, CppCompiler, FactoryRegistry, MemoryFs,
    RuntimeFactory, STDERR, STDOUT, SandboxError, SandboxOptions, SandboxResult, StreamTable,
    ToolchainArtifacts, ToolchainModule, ToolchainOptions, WORKSPACE_DIR,
};
use parking_lot::Mutex;

pub const SHARED_SOURCE: &str = "mem://clang-shared.wasm";
pub const DRIVER_SOURCE: &str = "mem://clang.wasm";
pub const SCRIPTED_FACTORY: &str = "scripted";
pub const COMPILER: &str = "clang++";

const EXE_MAGIC: &str = "FAKEEXE";

/// Serves artifacts from memory and counts fetches.
#[derive(Default)]
pub struct StaticFetcher {
    artifacts: HashMap<String, Vec<u8>>,
    pub fetches: AtomicUsize,
}

impl StaticFetcher {
    /// Both toolchain artifacts present.
    pub fn toolchain() -> Self {
        Self::default()
            .with(SHARED_SOURCE, b"shared runtime")
            .with(DRIVER_SOURCE, b"driver")
    }

    pub fn with(mut self, source: &str, bytes: &[u8]) -> Self {
        self.artifacts.insert(source.to_string(), bytes.to_vec());
        self
    }
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(&self, source: &ArtifactSource) -> Result<Vec<u8>, String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.artifacts
            .get(&source.to_string())
            .cloned()
            .ok_or_else(|| "404 Not Found".to_string())
    }
}

/// Builds [`ScriptedModule`]s, optionally after a delay.
#[derive(Default)]
pub struct ScriptedFactory {
    pub delay: Duration,
    pub compile_delay: Duration,
    /// Stream table of the most recently instantiated module.
    pub streams: Mutex<Option<Arc<StreamTable>>>,
}

impl ScriptedFactory {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_compile_delay(compile_delay: Duration) -> Self {
        Self {
            compile_delay,
            ..Default::default()
        }
    }

    pub fn last_streams(&self) -> Arc<StreamTable> {
        self.streams
            .lock()
            .clone()
            .expect("no module instantiated yet")
    }
}

#[async_trait]
impl RuntimeFactory for ScriptedFactory {
    async fn instantiate(
        &self,
        _artifacts: &ToolchainArtifacts,
        _options: &SandboxOptions,
    ) -> SandboxResult<Box<dyn ToolchainModule>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let module = ScriptedModule {
            fs: MemoryFs::new(),
            streams: Arc::new(StreamTable::new()),
            compile_delay: self.compile_delay,
        };
        *self.streams.lock() = Some(module.streams.clone());
        Ok(Box::new(module))
    }
}

pub struct ScriptedModule {
    fs: MemoryFs,
    streams: Arc<StreamTable>,
    compile_delay: Duration,
}

impl ToolchainModule for ScriptedModule {
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
        if argv[0] == COMPILER {
            self.compile(argv)
        } else {
            self.run(&argv[0])
        }
    }
}

impl ScriptedModule {
    fn compile(&mut self, argv: &[String]) -> SandboxResult<i32> {
        if !self.compile_delay.is_zero() {
            std::thread::sleep(self.compile_delay);
        }
        let source_path = argv.last().expect("source path");
        let output_path = argv
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|idx| argv.get(idx + 1))
            .expect("output path");
        let filename = source_path.rsplit('/').next().unwrap_or_default();

        // The workspace must hold only this call's source.
        let entries = self.fs.read_dir(WORKSPACE_DIR)?;
        let stale: Vec<_> = entries
            .iter()
            .filter(|name| !matches!(name.as_str(), "." | "..") && *name != filename)
            .collect();
        if !stale.is_empty() {
            self.err(&format!("stale workspace entries: {stale:?}\n"));
            return Ok(2);
        }

        let source = String::from_utf8(self.fs.read_file(source_path)?)
            .map_err(|e| SandboxError::CompilationFailure(e.to_string()))?;

        if source.contains("#error_internal") {
            self.out("partial diagnostics");
            return Err(SandboxError::ExecutionFailure(
                "trap: unreachable executed".to_string(),
            ));
        }
        if source.contains("#panic") {
            panic!("scripted toolchain panic");
        }

        if let Some(problem) = syntax_problem(&source) {
            self.err(&format!("{filename}:1:1: error: {problem}\n1 error generated.\n"));
            return Ok(1);
        }
        if source.contains("#no_output") {
            return Ok(0);
        }

        let mut program = vec![EXE_MAGIC.to_string()];
        for text in puts_calls(&source) {
            program.push(format!("puts {text}"));
        }
        program.push(format!("exit {}", return_code(&source)));
        self.fs.write_file(output_path, program.join("\n"))?;
        Ok(0)
    }

    fn run(&mut self, path: &str) -> SandboxResult<i32> {
        let program = String::from_utf8_lossy(&self.fs.read_file(path)?).to_string();
        let mut lines = program.lines();
        if lines.next() != Some(EXE_MAGIC) {
            self.err(&format!("{path}: exec format error\n"));
            return Ok(126);
        }
        for line in lines {
            if let Some(text) = line.strip_prefix("puts ") {
                self.out(&format!("{text}\n"));
            } else if let Some(code) = line.strip_prefix("exit ") {
                return Ok(code.parse().unwrap_or(0));
            }
        }
        Ok(0)
    }

    fn out(&self, text: &str) {
        self.streams.write(STDOUT, text.as_bytes());
    }

    fn err(&self, text: &str) {
        self.streams.write(STDERR, text.as_bytes());
    }
}

fn syntax_problem(source: &str) -> Option<&'static str> {
    let mut braces = 0i32;
    let mut parens = 0i32;
    for c in source.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => {}
        }
        if braces < 0 || parens < 0 {
            return Some("unexpected closing delimiter");
        }
    }
    if braces != 0 {
        return Some("expected '}'");
    }
    if parens != 0 {
        return Some("expected ')'");
    }
    if !source.contains("main(") {
        return Some("undefined reference to 'main'");
    }
    None
}

fn puts_calls(source: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("puts(\"") {
        rest = &rest[start + 6..];
        let Some(end) = rest.find("\")") else { break };
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    out
}

fn return_code(source: &str) -> i32 {
    source
        .find("return ")
        .map(|idx| &source[idx + 7..])
        .and_then(|rest| rest.split(';').next())
        .and_then(|code| code.trim().parse().ok())
        .unwrap_or(0)
}

/// Options pointing at the in-memory artifacts and the scripted factory.
pub fn options() -> SandboxOptions {
    SandboxOptions::new(
        ToolchainOptions::new(SHARED_SOURCE, DRIVER_SOURCE)
            .with_factory(SCRIPTED_FACTORY)
            .with_compiler(COMPILER),
    )
}

pub fn options_with_timeout(timeout: Duration) -> SandboxOptions {
    options().with_compiler(CompilerOptions::default().with_ready_timeout(timeout))
}

pub fn registry(factory: Arc<dyn RuntimeFactory>) -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register(SCRIPTED_FACTORY, factory);
    registry
}

/// A compiler over the scripted toolchain, plus its factory.
pub fn scripted_compiler() -> (CppCompiler, Arc<ScriptedFactory>) {
    scripted_compiler_with(ScriptedFactory::default(), options())
}

pub fn scripted_compiler_with(
    factory: ScriptedFactory,
    options: SandboxOptions,
) -> (CppCompiler, Arc<ScriptedFactory>) {
    let factory = Arc::new(factory);
    let compiler = CppCompiler::start(
        options,
        Arc::new(StaticFetcher::toolchain()),
        registry(factory.clone()),
    );
    (compiler, factory)
}
