//! stdin 轉發器 - 將 `vterm` 自身的 stdin 轉發到 session
//!
//! stdin 為互動式終端機時切換為 raw mode，讓按鍵原封不動送達子行程；
//! 回顯由 session 終端機的 line discipline 負責。guard 釋放時還原原本的模式。

use std::io::{self, IsTerminal, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};
use vterm::NativeConsole;

#[cfg(unix)]
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};

#[cfg(windows)]
use windows::Win32::System::Console::{
    GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE, ENABLE_ECHO_INPUT,
    ENABLE_LINE_INPUT, ENABLE_PROCESSED_INPUT, STD_INPUT_HANDLE,
};

/// Restores the terminal mode of stdin on drop
pub struct RawModeGuard {
    #[cfg(unix)]
    original: Termios,
    #[cfg(windows)]
    original: CONSOLE_MODE,
}

impl RawModeGuard {
    /// Put stdin into raw mode. `Ok(None)` when stdin is not a terminal.
    #[cfg(unix)]
    pub fn enable() -> io::Result<Option<Self>> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        let original = tcgetattr(&stdin)?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        debug!("stdin switched to raw mode");

        Ok(Some(Self { original }))
    }

    #[cfg(windows)]
    pub fn enable() -> io::Result<Option<Self>> {
        if !io::stdin().is_terminal() {
            return Ok(None);
        }

        // SAFETY: mode queries on the process's own stdin handle
        unsafe {
            let handle = GetStdHandle(STD_INPUT_HANDLE).map_err(io::Error::from)?;
            let mut mode = CONSOLE_MODE(0);
            if GetConsoleMode(handle, &mut mode).is_err() {
                return Ok(None);
            }

            let original = mode;
            mode.0 &= !(ENABLE_LINE_INPUT.0 | ENABLE_ECHO_INPUT.0 | ENABLE_PROCESSED_INPUT.0);
            SetConsoleMode(handle, mode).map_err(io::Error::from)?;
            debug!(mode = mode.0, "console input switched to raw mode");

            Ok(Some(Self { original }))
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let _ = tcsetattr(&io::stdin(), SetArg::TCSANOW, &self.original);
        }

        #[cfg(windows)]
        // SAFETY: restores the mode read in enable()
        unsafe {
            if let Ok(handle) = GetStdHandle(STD_INPUT_HANDLE) {
                let _ = SetConsoleMode(handle, self.original);
            }
        }
    }
}

/// Copy stdin into the session until either side reaches its end.
pub fn spawn(console: Arc<NativeConsole>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stdin-forwarder".into())
        .spawn(move || {
            let mut stdin = io::stdin();
            let mut buffer = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buffer) {
                    Ok(0) => {
                        debug!("stdin reached EOF");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "stdin read failed");
                        break;
                    }
                };
                trace!(bytes = n, "forwarding stdin");
                if let Err(e) = (&*console).write_all(&buffer[..n]) {
                    debug!(error = %e, "session no longer accepts input");
                    break;
                }
            }
        })
}
