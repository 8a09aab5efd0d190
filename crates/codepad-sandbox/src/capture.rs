//! Standard stream handler slots and scoped output capture.
//!
//! A toolchain module routes everything its programs write to fd 1 and fd 2
//! through a [`StreamTable`]. [`CaptureScope`] swaps both slots for
//! capturing sinks and puts the previous handlers back when it finishes or
//! is dropped, including during unwinding.

use std::sync::Arc;

use parking_lot::Mutex;

/// File descriptor of standard output.
pub const STDOUT: usize = 1;

/// File descriptor of standard error.
pub const STDERR: usize = 2;

/// Destination for bytes written to a standard stream.
pub trait OutputSink: Send + Sync {
    /// Accept one write. Buffers may split multi-byte characters.
    fn write(&self, bytes: &[u8]);
}

/// Shared handle to an output sink.
pub type SinkRef = Arc<dyn OutputSink>;

/// Default handler: forwards each write to `tracing` at debug level.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    stream: &'static str,
}

impl TracingSink {
    pub fn new(stream: &'static str) -> Self {
        Self { stream }
    }
}

impl OutputSink for TracingSink {
    fn write(&self, bytes: &[u8]) {
        tracing::debug!(
            stream = self.stream,
            text = %String::from_utf8_lossy(bytes),
            "Uncaptured toolchain output"
        );
    }
}

/// The two standard-stream handler slots of a module.
pub struct StreamTable {
    slots: Mutex<[SinkRef; 2]>,
}

impl StreamTable {
    /// A table whose handlers only log.
    pub fn new() -> Self {
        Self::with_handlers(
            Arc::new(TracingSink::new("stdout")),
            Arc::new(TracingSink::new("stderr")),
        )
    }

    /// A table with explicit stdout/stderr handlers.
    pub fn with_handlers(stdout: SinkRef, stderr: SinkRef) -> Self {
        Self {
            slots: Mutex::new([stdout, stderr]),
        }
    }

    /// Current handler for `fd`, if it is a standard output stream.
    pub fn get(&self, fd: usize) -> Option<SinkRef> {
        slot_index(fd).map(|idx| self.slots.lock()[idx].clone())
    }

    /// Write bytes to the handler currently installed for `fd`.
    ///
    /// Writes to other descriptors are dropped.
    pub fn write(&self, fd: usize, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        // Clone out so the sink runs without the slot lock held.
        if let Some(sink) = self.get(fd) {
            sink.write(bytes);
        }
    }

    fn swap(&self, handlers: [SinkRef; 2]) -> [SinkRef; 2] {
        std::mem::replace(&mut *self.slots.lock(), handlers)
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_index(fd: usize) -> Option<usize> {
    match fd {
        STDOUT => Some(0),
        STDERR => Some(1),
        _ => None,
    }
}

/// Text captured from both streams during a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Sink that decodes UTF-8 incrementally into a string.
#[derive(Default)]
struct CaptureSink {
    state: Mutex<Utf8Accumulator>,
}

impl OutputSink for CaptureSink {
    fn write(&self, bytes: &[u8]) {
        self.state.lock().push(bytes);
    }
}

impl CaptureSink {
    fn take(&self) -> String {
        std::mem::take(&mut *self.state.lock()).finish()
    }
}

/// Accumulates text, carrying an incomplete trailing sequence to the next write.
#[derive(Default)]
struct Utf8Accumulator {
    text: String,
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.pending.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            self.text.push(char::REPLACEMENT_CHARACTER);
        }
        self.text
    }
}

/// Capturing handlers installed on a [`StreamTable`] for the lifetime of the value.
pub struct CaptureScope {
    table: Arc<StreamTable>,
    previous: Option<[SinkRef; 2]>,
    stdout: Arc<CaptureSink>,
    stderr: Arc<CaptureSink>,
}

impl CaptureScope {
    /// Swap capturing sinks into both slots of `table`.
    pub fn install(table: Arc<StreamTable>) -> Self {
        let stdout = Arc::new(CaptureSink::default());
        let stderr = Arc::new(CaptureSink::default());
        let previous = table.swap([stdout.clone() as SinkRef, stderr.clone() as SinkRef]);
        Self {
            table,
            previous: Some(previous),
            stdout,
            stderr,
        }
    }

    /// Restore the previous handlers and return what was captured.
    pub fn finish(mut self) -> Captured {
        self.restore();
        Captured {
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
        }
    }

    fn restore(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.table.swap(previous);
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Run `f` with both streams of `table` captured.
pub fn capture<T>(table: &Arc<StreamTable>, f: impl FnOnce() -> T) -> (T, Captured) {
    let scope = CaptureScope::install(table.clone());
    let value = f();
    (value, scope.finish())
}
