//! Unix 信號註冊
//!
//! 使用 signal-hook 將 POSIX 信號轉為旗標

use super::SignalFlags;
use anyhow::{Context, Result};
use std::io;
use std::sync::Arc;

/// Register handlers that set flags in the returned `SignalFlags`.
pub fn setup_signal_handlers() -> Result<SignalFlags> {
    use signal_hook::consts::signal::*;
    use signal_hook::flag;

    let flags = SignalFlags::new();

    flag::register(SIGWINCH, Arc::clone(&flags.sigwinch_received))
        .context("Failed to register SIGWINCH handler")?;
    flag::register(SIGTERM, Arc::clone(&flags.sigterm_received))
        .context("Failed to register SIGTERM handler")?;
    flag::register(SIGINT, Arc::clone(&flags.sigint_received))
        .context("Failed to register SIGINT handler")?;
    flag::register(SIGHUP, Arc::clone(&flags.sighup_received))
        .context("Failed to register SIGHUP handler")?;

    Ok(flags)
}

/// Size of the terminal `vterm` itself runs in, as `(cols, rows)`
pub fn current_size() -> Option<(u16, u16)> {
    vterm::terminal_size(&io::stdout())
        .or_else(|| vterm::terminal_size(&io::stdin()))
        .map(|size| (size.cols, size.rows))
}
