//! FIFO request queue in front of a [`Toolchain`].
//!
//! The toolchain has one filesystem and one pair of stream slots, so calls
//! must not overlap. The queue owns the toolchain on a blocking worker and
//! serves requests strictly in arrival order, one at a time.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span};
use uuid::Uuid;

use crate::driver::Toolchain;
use crate::error::{SandboxError, SandboxResult};
use crate::result::{CompilationResult, ExecutionOutput};

enum Job {
    Compile {
        id: Uuid,
        source: String,
        filename: String,
        run: bool,
        reply: oneshot::Sender<CompilationResult>,
    },
    Execute {
        id: Uuid,
        executable: Vec<u8>,
        reply: oneshot::Sender<ExecutionOutput>,
    },
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone)]
pub struct CompileQueue {
    tx: mpsc::Sender<Job>,
}

impl CompileQueue {
    /// Move `toolchain` onto a blocking worker and return the queue feeding it.
    ///
    /// The worker stops once every [`CompileQueue`] clone is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn(toolchain: Toolchain, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || run_worker(toolchain, rx));
        (Self { tx }, worker)
    }

    /// Queue a compile-and-run and wait for its result.
    pub async fn compile(&self, source: &str, filename: &str) -> SandboxResult<CompilationResult> {
        self.submit_compile(source, filename, true).await
    }

    /// Queue a compile that skips running the program.
    pub async fn build(&self, source: &str, filename: &str) -> SandboxResult<CompilationResult> {
        self.submit_compile(source, filename, false).await
    }

    async fn submit_compile(
        &self,
        source: &str,
        filename: &str,
        run: bool,
    ) -> SandboxResult<CompilationResult> {
        let (reply, rx) = oneshot::channel();
        let job = Job::Compile {
            id: Uuid::new_v4(),
            source: source.to_string(),
            filename: filename.to_string(),
            run,
            reply,
        };
        self.tx.send(job).await.map_err(|_| SandboxError::QueueClosed)?;
        rx.await.map_err(|_| SandboxError::QueueClosed)
    }

    /// Queue an execution and wait for its output.
    pub async fn execute(&self, executable: &[u8]) -> SandboxResult<ExecutionOutput> {
        let (reply, rx) = oneshot::channel();
        let job = Job::Execute {
            id: Uuid::new_v4(),
            executable: executable.to_vec(),
            reply,
        };
        self.tx.send(job).await.map_err(|_| SandboxError::QueueClosed)?;
        rx.await.map_err(|_| SandboxError::QueueClosed)
    }
}

fn run_worker(mut toolchain: Toolchain, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Compile {
                id,
                source,
                filename,
                run,
                reply,
            } => {
                let _span = debug_span!("compile", job = %id, run).entered();
                let result = if run {
                    toolchain.compile(&source, &filename)
                } else {
                    toolchain.build(&source, &filename)
                };
                // A caller that stopped waiting is not an error.
                let _ = reply.send(result);
            }
            Job::Execute {
                id,
                executable,
                reply,
            } => {
                let _span = debug_span!("execute", job = %id).entered();
                let output = toolchain.execute(&executable);
                let _ = reply.send(output);
            }
        }
    }
    debug!("Compile queue closed, worker exiting");
}
