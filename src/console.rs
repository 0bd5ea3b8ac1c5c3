//! The console capability contract and the platform factory.
//!
//! On Unix a console is backed by a kernel pseudo-terminal. On Windows it
//! is backed by the winpty agent, which owns an emulated console and relays
//! its I/O through named pipes.

use crate::error::Result;
use crate::session::Session;
use crate::status::{ExitStatus, Signal};
use std::path::Path;

/// Operations every console session supports.
///
/// Everything except construction, [`set_cwd`](Console::set_cwd),
/// [`set_env`](Console::set_env), [`set_size`](Console::set_size) and
/// [`size`](Console::size) fails with
/// [`Error::NotStarted`](crate::Error::NotStarted) until
/// [`start`](Console::start) succeeds.
pub trait Console: Send + Sync {
    /// Read child output. Returns `Ok(0)` once the child has exited and
    /// all buffered output was consumed.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write to the child's terminal input.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Release the backend. Fails when the session was never started or is
    /// already closed.
    fn close(&self) -> Result<()>;

    /// Set the terminal geometry. While running the change is propagated
    /// to the live terminal immediately.
    fn set_size(&self, cols: u16, rows: u16) -> Result<()>;

    /// Last geometry set, as `(cols, rows)`.
    fn size(&self) -> Result<(u16, u16)>;

    /// Launch `args[0]` with the remaining elements as its arguments. No
    /// shell interpretation is performed.
    fn start(&self, args: &[String]) -> Result<()>;

    /// Block until the child exits.
    fn wait(&self) -> Result<ExitStatus>;

    fn pid(&self) -> Result<u32>;

    /// Forcibly terminate the child.
    fn kill(&self) -> Result<()>;

    fn signal(&self, signal: Signal) -> Result<()>;

    /// Working directory for the child. Only valid before `start`.
    fn set_cwd(&self, path: &Path) -> Result<()>;

    /// Add `KEY=VALUE` entries on top of the inherited environment. Only
    /// valid before `start`.
    fn set_env(&self, entries: &[String]) -> Result<()>;
}

#[cfg(unix)]
pub type NativeConsole = Session<crate::pty::PtyBackend>;

#[cfg(windows)]
pub type NativeConsole = Session<crate::broker::WinptyBackend>;

/// Create a console session for the host platform with the given initial
/// geometry.
pub fn new(cols: u16, rows: u16) -> Result<NativeConsole> {
    Session::new(cols, rows)
}
