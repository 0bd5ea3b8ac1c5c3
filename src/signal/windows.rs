//! Windows 控制訊號與視窗大小輪詢
//!
//! 透過 console control handler 及輪詢執行緒，模擬 Unix 下的 signal 行為。

use super::SignalFlags;
use anyhow::{anyhow, Context, Result};
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Duration;
use windows::Win32::Foundation::{BOOL, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Console::{
    GetConsoleScreenBufferInfo, GetStdHandle, SetConsoleCtrlHandler, CONSOLE_SCREEN_BUFFER_INFO,
    CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT, STD_OUTPUT_HANDLE,
};

static SIGNAL_STATE: OnceLock<SignalFlags> = OnceLock::new();
static RESIZE_THREAD: OnceLock<()> = OnceLock::new();

const RESIZE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Register the console control handler and start the resize poller.
pub fn setup_signal_handlers() -> Result<SignalFlags> {
    if let Some(flags) = SIGNAL_STATE.get() {
        return Ok(flags.clone());
    }

    // SAFETY: console_handler only touches atomics
    unsafe { SetConsoleCtrlHandler(Some(console_handler), BOOL(1)) }
        .context("Failed to register console control handler")?;

    let flags = SignalFlags::new();
    SIGNAL_STATE
        .set(flags.clone())
        .map_err(|_| anyhow!("Signal handler already registered"))?;
    start_resize_monitor(flags.clone());
    Ok(flags)
}

unsafe extern "system" fn console_handler(ctrl_type: u32) -> BOOL {
    if let Some(flags) = SIGNAL_STATE.get() {
        let flag = match ctrl_type {
            CTRL_C_EVENT => &flags.sigint_received,
            CTRL_BREAK_EVENT => &flags.sigterm_received,
            CTRL_CLOSE_EVENT => &flags.sighup_received,
            _ => return BOOL(0),
        };
        flag.store(true, Ordering::SeqCst);
        return BOOL(1);
    }
    BOOL(0)
}

fn start_resize_monitor(flags: SignalFlags) {
    RESIZE_THREAD.get_or_init(|| {
        std::thread::spawn(move || {
            let mut last_size = current_size();
            loop {
                let size = current_size();
                if size.is_some() && size != last_size {
                    flags.sigwinch_received.store(true, Ordering::SeqCst);
                }
                last_size = size;
                std::thread::sleep(RESIZE_POLL_INTERVAL);
            }
        });
    });
}

/// Visible window of the console `vterm` runs in, as `(cols, rows)`
pub fn current_size() -> Option<(u16, u16)> {
    // SAFETY: plain queries on the process's own stdout handle
    unsafe {
        let handle = match GetStdHandle(STD_OUTPUT_HANDLE) {
            Ok(h) if h != HANDLE(0) && h != INVALID_HANDLE_VALUE => h,
            _ => return None,
        };
        let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
        GetConsoleScreenBufferInfo(handle, &mut info).ok()?;
        let cols = (info.srWindow.Right - info.srWindow.Left + 1) as u16;
        let rows = (info.srWindow.Bottom - info.srWindow.Top + 1) as u16;
        Some((cols, rows))
    }
}
