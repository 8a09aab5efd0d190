//! Result values surfaced to callers.

use serde::{Deserialize, Serialize};

use crate::capture::Captured;

/// Outcome of one compile call (and the run that follows a successful build).
///
/// `success` reports whether the compiler exited zero. A successful result
/// may still lack `executable` when the compiled output could not be read; in
/// that case `error` carries the reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationResult {
    pub success: bool,
    /// Compiler output (stdout, then any diagnostics on stderr).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
}

impl CompilationResult {
    /// A failed result carrying only an error message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// The compiler exited non-zero.
    ///
    /// The error is stderr, else stdout, else a generic message.
    pub(crate) fn rejected(exit_code: i32, captured: Captured) -> Self {
        let error = if !captured.stderr.is_empty() {
            captured.stderr.clone()
        } else if !captured.stdout.is_empty() {
            captured.stdout.clone()
        } else {
            format!("Compilation failed with exit code {exit_code}")
        };
        Self {
            success: false,
            output: Some(combined_output(&captured)),
            error: Some(error),
            ..Default::default()
        }
    }

    /// The compiler exited zero and produced `executable`, which then ran.
    pub(crate) fn compiled(captured: &Captured, executable: Vec<u8>, run: ExecutionOutput) -> Self {
        Self {
            success: true,
            output: Some(combined_output(captured)),
            error: None,
            executable: Some(executable),
            execution_output: Some(run.output),
            execution_error: Some(run.error),
        }
    }

    /// The compiler exited zero and produced `executable`, which was not run.
    pub(crate) fn built(captured: &Captured, executable: Vec<u8>) -> Self {
        Self {
            success: true,
            output: Some(combined_output(captured)),
            executable: Some(executable),
            ..Default::default()
        }
    }

    /// The compiler exited zero but its output is unusable.
    pub(crate) fn unreadable(captured: &Captured, note: String) -> Self {
        Self {
            success: true,
            output: Some(combined_output(captured)),
            error: Some(note),
            ..Default::default()
        }
    }

    /// Whether there is a program to run.
    pub fn has_executable(&self) -> bool {
        self.executable.as_ref().is_some_and(|bytes| !bytes.is_empty())
    }
}

/// Outcome of running a compiled program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutput {
    /// Captured stdout.
    pub output: String,
    /// Captured stderr, a synthesized exit message, or the reason the
    /// program could not run.
    pub error: String,
    /// Exit status, absent when the program never reached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecutionOutput {
    pub(crate) fn exited(exit_code: i32, captured: Captured) -> Self {
        let error = if exit_code != 0 && captured.stderr.is_empty() {
            format!("Program exited with code {exit_code}")
        } else {
            captured.stderr
        };
        Self {
            output: captured.stdout,
            error,
            exit_code: Some(exit_code),
        }
    }

    pub(crate) fn aborted(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: message.into(),
            exit_code: None,
        }
    }

    /// Whether the program exited zero.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Join stdout and stderr for display.
fn combined_output(captured: &Captured) -> String {
    if captured.stderr.is_empty() {
        captured.stdout.clone()
    } else if captured.stdout.is_empty() {
        captured.stderr.clone()
    } else {
        format!("{}\n{}", captured.stdout, captured.stderr)
    }
}
