//! Kernel pseudo-terminal backend (Unix).
//!
//! Windows has no in-process PTY here; the broker module provides the
//! agent-based backend on that platform.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{terminal_size, PtyBackend};
