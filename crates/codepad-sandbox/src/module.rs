//! The toolchain module handle.

use std::sync::Arc;

use crate::capture::StreamTable;
use crate::error::SandboxResult;
use crate::vfs::MemoryFs;

/// An instantiated toolchain: a private filesystem, two output stream
/// slots, and an entry point that behaves like `main(argc, argv)`.
///
/// Implementations run synchronously. The compile queue keeps each module on
/// a single blocking worker, so one call is in flight at a time.
pub trait ToolchainModule: Send {
    /// The module's virtual filesystem.
    fn fs(&self) -> &MemoryFs;

    /// Mutable access to the module's virtual filesystem.
    fn fs_mut(&mut self) -> &mut MemoryFs;

    /// Handler slots the module writes fd 1 and fd 2 through.
    fn streams(&self) -> Arc<StreamTable>;

    /// Invoke the entry point with `argv` and return the exit code.
    ///
    /// `argv[0]` is either the compiler name or the path of an executable
    /// file in [`fs`](Self::fs). An `Err` means the call could not run to an
    /// exit status (trap, link failure, resource exhaustion).
    fn call_main(&mut self, argv: &[String]) -> SandboxResult<i32>;
}
