//! Runtime initialization and readiness tracking.
//!
//! ```text
//! Uninitialized ──► Initializing ──► Ready
//!                        │
//!                        └─────────► Failed
//! ```
//!
//! `Ready` and `Failed` are terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SandboxOptions;
use crate::driver::{TMP_DIR, WORKSPACE_DIR};
use crate::error::{SandboxError, SandboxResult};
use crate::loader::{ModuleLoader, ToolchainArtifacts};
use crate::module::ToolchainModule;
use crate::wasm::{WASI_FACTORY, WasiFactory};

/// Builds a [`ToolchainModule`] from loaded artifacts.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn instantiate(
        &self,
        artifacts: &ToolchainArtifacts,
        options: &SandboxOptions,
    ) -> SandboxResult<Box<dyn ToolchainModule>>;
}

/// Named runtime factories.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn RuntimeFactory>>,
}

impl FactoryRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in wasmtime factory under `"wasi"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(WASI_FACTORY, Arc::new(WasiFactory));
        registry
    }

    /// Register (or replace) a factory.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn RuntimeFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuntimeFactory>> {
        self.factories.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Lifecycle state of a compiler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

impl ReadyState {
    /// Whether no further transition can happen.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed(_))
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Observable readiness flag.
pub struct Readiness {
    tx: watch::Sender<ReadyState>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadyState::Uninitialized);
        Self { tx }
    }

    /// Current state.
    pub fn state(&self) -> ReadyState {
        self.tx.borrow().clone()
    }

    /// Move to `next`. Transitions out of a settled state are ignored.
    pub fn set(&self, next: ReadyState) {
        let changed = self.tx.send_if_modified(|current| {
            if current.is_settled() || *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            info!(state = %next, "Toolchain state changed");
        }
    }

    /// Wait until the state settles, for at most `timeout`.
    ///
    /// A timeout fails only this wait; calling again waits again.
    pub async fn wait(&self, timeout: Duration) -> SandboxResult<()> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(timeout, rx.wait_for(ReadyState::is_settled)).await;
        match settled {
            Err(_) => Err(SandboxError::InitializationTimeout(timeout)),
            Ok(Err(_)) => Err(SandboxError::InitializationFailed(
                "readiness channel closed".to_string(),
            )),
            Ok(Ok(state)) => match &*state {
                ReadyState::Failed(reason) => {
                    Err(SandboxError::InitializationFailed(reason.clone()))
                }
                _ => Ok(()),
            },
        }
    }
}

/// Loads the toolchain artifacts and instantiates the module.
pub struct RuntimeInitializer {
    loader: ModuleLoader,
    registry: FactoryRegistry,
    options: SandboxOptions,
}

/// A freshly instantiated module plus the artifacts it came from.
pub struct Initialized {
    pub module: Box<dyn ToolchainModule>,
    pub artifacts: ToolchainArtifacts,
}

impl RuntimeInitializer {
    pub fn new(loader: ModuleLoader, registry: FactoryRegistry, options: SandboxOptions) -> Self {
        Self {
            loader,
            registry,
            options,
        }
    }

    /// Load both artifacts, look up the factory, instantiate, and provision
    /// the workspace directories.
    pub async fn initialize(mut self) -> SandboxResult<Initialized> {
        let toolchain = &self.options.toolchain;
        let artifacts = self
            .loader
            .load_toolchain(&toolchain.shared_runtime, &toolchain.driver)
            .await?;

        let factory = self.registry.get(&toolchain.factory).ok_or_else(|| {
            warn!(
                factory = %toolchain.factory,
                registered = ?self.registry.names(),
                "Runtime factory not registered"
            );
            SandboxError::RuntimeUnavailable {
                factory: toolchain.factory.clone(),
                reason: "is not registered".to_string(),
            }
        })?;

        let mut module = factory.instantiate(&artifacts, &self.options).await?;
        provision_workspace(module.as_mut())?;
        debug!(factory = %toolchain.factory, "Toolchain module instantiated");

        Ok(Initialized { module, artifacts })
    }
}

/// Create the scratch directories. Existing directories are fine.
pub(crate) fn provision_workspace(module: &mut dyn ToolchainModule) -> SandboxResult<()> {
    let fs = module.fs_mut();
    fs.create_dir_all(TMP_DIR)?;
    fs.create_dir_all(WORKSPACE_DIR)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let readiness = Readiness::new();
        assert_eq!(readiness.state(), ReadyState::Uninitialized);
        assert!(!readiness.state().is_settled());
    }

    #[test]
    fn test_settled_states_are_terminal() {
        let readiness = Readiness::new();
        readiness.set(ReadyState::Initializing);
        readiness.set(ReadyState::Ready);
        readiness.set(ReadyState::Failed("late".into()));
        readiness.set(ReadyState::Initializing);
        assert_eq!(readiness.state(), ReadyState::Ready);
    }

    #[tokio::test]
    async fn test_wait_returns_when_ready() {
        let readiness = Arc::new(Readiness::new());
        readiness.set(ReadyState::Initializing);

        let waiter = {
            let readiness = readiness.clone();
            tokio::spawn(async move { readiness.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        readiness.set(ReadyState::Ready);

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let readiness = Readiness::new();
        readiness.set(ReadyState::Failed("no driver".into()));
        let err = readiness.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SandboxError::InitializationFailed(ref m) if m == "no driver"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_can_retry() {
        let readiness = Readiness::new();
        readiness.set(ReadyState::Initializing);

        let err = readiness.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, SandboxError::InitializationTimeout(_)));

        readiness.set(ReadyState::Ready);
        readiness.wait(Duration::from_millis(100)).await.unwrap();
    }

    #[test]
    fn test_registry_defaults() {
        let registry = FactoryRegistry::with_defaults();
        assert!(registry.get(WASI_FACTORY).is_some());
        assert!(registry.get("emscripten").is_none());
        assert_eq!(registry.names(), vec![WASI_FACTORY.to_string()]);
    }
}
