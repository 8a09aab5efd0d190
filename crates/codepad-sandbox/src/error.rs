//! Error types for toolchain loading, compilation and execution.

use std::time::Duration;

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while loading the toolchain or driving it.
///
/// None of these cross [`CppCompiler`](crate::CppCompiler)'s public contract;
/// they are folded into [`CompilationResult`](crate::CompilationResult) fields.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A toolchain artifact could not be fetched.
    #[error("Failed to load toolchain artifact '{url}': {reason}")]
    ScriptLoad { url: String, reason: String },

    /// The configured runtime factory is not registered, or the artifacts
    /// do not expose what it needs.
    #[error("Toolchain runtime unavailable: factory '{factory}' {reason}")]
    RuntimeUnavailable { factory: String, reason: String },

    /// The toolchain did not become ready within the allowed wait.
    #[error("Toolchain not ready after {0:?}")]
    InitializationTimeout(Duration),

    /// Initialization ran and failed; the compiler stays unusable.
    #[error("Toolchain initialization failed: {0}")]
    InitializationFailed(String),

    /// The compiler exited non-zero.
    #[error("Compilation failed: {0}")]
    CompilationFailure(String),

    /// The program could not run or trapped.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// The compiler exited zero but its output could not be read.
    #[error("Compiled output could not be read from {path}: {source}")]
    ArtifactRead {
        path: String,
        #[source]
        source: FsError,
    },

    /// Virtual filesystem error.
    #[error("Virtual filesystem error: {0}")]
    Fs(#[from] FsError),

    /// The request queue worker has stopped.
    #[error("Compile queue is closed")]
    QueueClosed,

    /// Host IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from [`MemoryFs`](crate::MemoryFs) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
