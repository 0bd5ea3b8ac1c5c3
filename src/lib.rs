//! Cross-platform virtual terminal sessions.
//!
//! A session spawns a child process attached to a pseudo-terminal and
//! exposes the terminal as a raw byte stream. Escape sequences pass through
//! untouched.
//!
//! ```no_run
//! use std::io::Read;
//! use vterm::Console;
//!
//! let console = vterm::new(120, 60)?;
//! console.start(&["ls".to_string(), "-l".to_string()])?;
//!
//! let mut output = Vec::new();
//! (&console).read_to_end(&mut output)?;
//! let status = console.wait()?;
//! console.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(all(not(unix), not(windows)))]
compile_error!("vterm supports Unix-like systems and Windows only");

pub mod backend;
pub mod console;
pub mod error;
pub mod pty;
pub mod session;
pub mod status;

#[cfg(windows)]
pub mod broker;
#[cfg(all(test, not(windows)))]
mod broker;

pub use backend::{Backend, SpawnRequest, WindowSize};
pub use console::{new, Console, NativeConsole};
pub use error::{Error, Result, ReturnCode};
#[cfg(unix)]
pub use pty::terminal_size;
pub use session::{Environment, Session};
pub use status::{ExitStatus, Signal};
