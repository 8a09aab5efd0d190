//! Toolchain artifact loading.
//!
//! The toolchain ships as two artifacts: a shared runtime and the compiler
//! driver that links against it. [`ModuleLoader`] fetches them in order,
//! one at a time, and remembers each by its stable id so a repeated load is
//! a no-op.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{SandboxError, SandboxResult};

/// Stable id of the shared runtime artifact.
pub const SHARED_RUNTIME_ID: &str = "shared-runtime";

/// Stable id of the compiler driver artifact.
pub const DRIVER_ID: &str = "driver";

/// Where an artifact's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Local file (plain path or `file://` URL).
    File(PathBuf),
    /// `http://` or `https://` URL.
    Http(String),
}

impl ArtifactSource {
    /// Classify a configured source string.
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            Self::Http(source.to_string())
        } else if let Some(path) = source.strip_prefix("file://") {
            Self::File(PathBuf::from(path))
        } else {
            Self::File(PathBuf::from(source))
        }
    }
}

impl std::fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Http(url) => write!(f, "{url}"),
        }
    }
}

/// A request to load one artifact.
#[derive(Debug, Clone)]
pub struct ArtifactSpec {
    /// Stable identifier; loading the same id twice fetches once.
    pub id: String,
    pub source: ArtifactSource,
}

impl ArtifactSpec {
    pub fn new(id: impl Into<String>, source: &str) -> Self {
        Self {
            id: id.into(),
            source: ArtifactSource::parse(source),
        }
    }
}

/// A fetched artifact.
#[derive(Debug)]
pub struct Artifact {
    pub id: String,
    pub source: ArtifactSource,
    pub bytes: Vec<u8>,
    /// SHA-256 hex digest of `bytes`.
    pub sha256: String,
}

/// The two toolchain artifacts, in link order.
#[derive(Debug, Clone)]
pub struct ToolchainArtifacts {
    pub shared_runtime: Arc<Artifact>,
    pub driver: Arc<Artifact>,
}

/// Fetches raw artifact bytes.
///
/// Injected into [`ModuleLoader`] so tests can serve artifacts from memory.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch the bytes behind `source`, or a human-readable reason.
    async fn fetch(&self, source: &ArtifactSource) -> Result<Vec<u8>, String>;
}

/// Reads local files with tokio and downloads URLs with reqwest.
#[derive(Debug, Clone, Default)]
pub struct DefaultFetcher {
    client: reqwest::Client,
}

impl DefaultFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactFetcher for DefaultFetcher {
    async fn fetch(&self, source: &ArtifactSource) -> Result<Vec<u8>, String> {
        match source {
            ArtifactSource::File(path) => tokio::fs::read(path).await.map_err(|e| e.to_string()),
            ArtifactSource::Http(url) => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?
                    .error_for_status()
                    .map_err(|e| e.to_string())?;
                let bytes = response.bytes().await.map_err(|e| e.to_string())?;
                Ok(bytes.to_vec())
            }
        }
    }
}

/// Loads artifacts sequentially and at most once per id.
pub struct ModuleLoader {
    fetcher: Arc<dyn ArtifactFetcher>,
    loaded: HashMap<String, Arc<Artifact>>,
}

impl ModuleLoader {
    pub fn new(fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            fetcher,
            loaded: HashMap::new(),
        }
    }

    /// Load one artifact, returning the cached copy if its id was loaded before.
    pub async fn load(&mut self, spec: &ArtifactSpec) -> SandboxResult<Arc<Artifact>> {
        if let Some(artifact) = self.loaded.get(&spec.id) {
            debug!(artifact = %spec.id, "Artifact already loaded");
            return Ok(artifact.clone());
        }

        let start = Instant::now();
        let bytes = self
            .fetcher
            .fetch(&spec.source)
            .await
            .map_err(|reason| SandboxError::ScriptLoad {
                url: spec.source.to_string(),
                reason,
            })?;
        if bytes.is_empty() {
            return Err(SandboxError::ScriptLoad {
                url: spec.source.to_string(),
                reason: "artifact is empty".to_string(),
            });
        }

        let artifact = Arc::new(Artifact {
            id: spec.id.clone(),
            source: spec.source.clone(),
            sha256: sha256_hex(&bytes),
            bytes,
        });
        debug!(
            artifact = %artifact.id,
            source = %artifact.source,
            sha256 = %artifact.sha256,
            size = artifact.bytes.len(),
            elapsed = ?start.elapsed(),
            "Loaded toolchain artifact"
        );
        self.loaded.insert(spec.id.clone(), artifact.clone());
        Ok(artifact)
    }

    /// Load artifacts in order. Each load completes before the next starts.
    pub async fn load_all(&mut self, specs: &[ArtifactSpec]) -> SandboxResult<Vec<Arc<Artifact>>> {
        let mut artifacts = Vec::with_capacity(specs.len());
        for spec in specs {
            artifacts.push(self.load(spec).await?);
        }
        Ok(artifacts)
    }

    /// Load the shared runtime, then the driver.
    pub async fn load_toolchain(
        &mut self,
        shared_runtime: &str,
        driver: &str,
    ) -> SandboxResult<ToolchainArtifacts> {
        let shared_runtime = self
            .load(&ArtifactSpec::new(SHARED_RUNTIME_ID, shared_runtime))
            .await?;
        let driver = self.load(&ArtifactSpec::new(DRIVER_ID, driver)).await?;
        Ok(ToolchainArtifacts {
            shared_runtime,
            driver,
        })
    }

    /// Whether an artifact with this id has been loaded.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded.contains_key(id)
    }
}

/// Compute SHA-256 hex digest of a byte slice.
pub(crate) fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}
