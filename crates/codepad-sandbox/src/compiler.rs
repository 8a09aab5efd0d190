//! The public compile-and-run adapter.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use codepad_config::{CodepadConfig, ConfigError};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::config::SandboxOptions;
use crate::driver::{Toolchain, panic_message};
use crate::error::{SandboxError, SandboxResult};
use crate::loader::{ArtifactFetcher, DefaultFetcher, ModuleLoader};
use crate::queue::CompileQueue;
use crate::result::{CompilationResult, ExecutionOutput};
use crate::runtime::{FactoryRegistry, Initialized, ReadyState, Readiness, RuntimeInitializer};

/// What the running toolchain was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolchainInfo {
    pub factory: String,
    pub shared_runtime_sha256: String,
    pub driver_sha256: String,
}

/// Compiles C++ source with a WebAssembly toolchain and runs the result.
///
/// Construction starts loading the toolchain in the background. Calls made
/// before it is ready wait up to the configured ready timeout. Calls are
/// served one at a time in arrival order.
///
/// None of the call methods return errors: failures are folded into the
/// returned [`CompilationResult`] or [`ExecutionOutput`].
///
/// ```ignore
/// let compiler = CppCompiler::from_config(&config)?;
/// let result = compiler.compile("int main() { return 0; }").await;
/// assert!(result.success);
/// ```
pub struct CppCompiler {
    readiness: Arc<Readiness>,
    queue: Arc<OnceLock<CompileQueue>>,
    info: Arc<OnceLock<ToolchainInfo>>,
    options: SandboxOptions,
    init: AbortHandle,
}

impl CppCompiler {
    /// Start initialization with the default fetcher and factories.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(options: SandboxOptions) -> Self {
        Self::start(
            options,
            Arc::new(DefaultFetcher::new()),
            FactoryRegistry::with_defaults(),
        )
    }

    /// Start initialization with the given fetcher and factory registry.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        options: SandboxOptions,
        fetcher: Arc<dyn ArtifactFetcher>,
        registry: FactoryRegistry,
    ) -> Self {
        let readiness = Arc::new(Readiness::new());
        let queue = Arc::new(OnceLock::new());
        let info = Arc::new(OnceLock::new());

        readiness.set(ReadyState::Initializing);
        let task = tokio::spawn(initialize(
            ModuleLoader::new(fetcher),
            registry,
            options.clone(),
            readiness.clone(),
            queue.clone(),
            info.clone(),
        ));
        let init = task.abort_handle();
        tokio::spawn(supervise(task, readiness.clone()));

        Self {
            readiness,
            queue,
            info,
            options,
            init,
        }
    }

    /// Build options from config and start with the defaults.
    pub fn from_config(config: &CodepadConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(SandboxOptions::from_config(config)?))
    }

    /// Compile `source` under the default filename and run it.
    pub async fn compile(&self, source: &str) -> CompilationResult {
        self.compile_named(source, &self.options.compiler.default_filename)
            .await
    }

    /// Compile `source` as `filename` and run it.
    pub async fn compile_named(&self, source: &str, filename: &str) -> CompilationResult {
        let result = match self.ready_queue().await {
            Ok(queue) => queue.compile(source, filename).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            debug!(error = %e, "Compile request failed");
            CompilationResult::failure(e.to_string())
        })
    }

    /// Compile `source` as `filename` without running it.
    pub async fn build(&self, source: &str, filename: &str) -> CompilationResult {
        let result = match self.ready_queue().await {
            Ok(queue) => queue.build(source, filename).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| CompilationResult::failure(e.to_string()))
    }

    /// Run a previously compiled executable.
    pub async fn execute(&self, executable: &[u8]) -> ExecutionOutput {
        let output = match self.ready_queue().await {
            Ok(queue) => queue.execute(executable).await,
            Err(e) => Err(e),
        };
        output.unwrap_or_else(|e| ExecutionOutput::aborted(e.to_string()))
    }

    /// Current readiness.
    pub fn state(&self) -> ReadyState {
        self.readiness.state()
    }

    /// Wait for initialization to settle.
    pub async fn wait_ready(&self, timeout: Duration) -> SandboxResult<()> {
        self.readiness.wait(timeout).await
    }

    /// Artifact digests, once ready.
    pub fn info(&self) -> Option<&ToolchainInfo> {
        self.info.get()
    }

    /// The options this compiler was started with.
    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    async fn ready_queue(&self) -> SandboxResult<&CompileQueue> {
        self.readiness
            .wait(self.options.compiler.ready_timeout)
            .await?;
        self.queue.get().ok_or_else(|| {
            SandboxError::InitializationFailed("toolchain ready without a queue".to_string())
        })
    }
}

impl Drop for CppCompiler {
    fn drop(&mut self) {
        self.init.abort();
    }
}

/// Marks readiness `Failed` when initialization panics instead of returning.
async fn supervise(task: JoinHandle<()>, readiness: Arc<Readiness>) {
    if let Err(e) = task.await
        && e.is_panic()
    {
        let reason = panic_message(e.into_panic());
        error!(error = %reason, "Toolchain initialization panicked");
        readiness.set(ReadyState::Failed(reason));
    }
}

async fn initialize(
    loader: ModuleLoader,
    registry: FactoryRegistry,
    options: SandboxOptions,
    readiness: Arc<Readiness>,
    queue: Arc<OnceLock<CompileQueue>>,
    info: Arc<OnceLock<ToolchainInfo>>,
) {
    let initializer = RuntimeInitializer::new(loader, registry, options.clone());
    match initializer.initialize().await {
        Ok(Initialized { module, artifacts }) => {
            let toolchain = Toolchain::new(
                module,
                options.toolchain.compiler.clone(),
                options.compiler.clone(),
            );
            let (compile_queue, _worker) =
                CompileQueue::spawn(toolchain, options.compiler.queue_capacity);
            let _ = queue.set(compile_queue);
            let _ = info.set(ToolchainInfo {
                factory: options.toolchain.factory.clone(),
                shared_runtime_sha256: artifacts.shared_runtime.sha256.clone(),
                driver_sha256: artifacts.driver.sha256.clone(),
            });
            readiness.set(ReadyState::Ready);
        }
        Err(e) => {
            warn!(error = %e, "Toolchain initialization failed");
            readiness.set(ReadyState::Failed(e.to_string()));
        }
    }
}
