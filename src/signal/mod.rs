//! Signal/Console Event 轉送層
//!
//! 處理函式只設定旗標；主迴圈輪詢旗標並轉換為 session 操作
//! （視窗大小改變時呼叫 `set_size`，終止請求時呼叫 `kill`）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flags shared between the handlers and the main loop
#[derive(Clone)]
pub struct SignalFlags {
    pub sigwinch_received: Arc<AtomicBool>,
    pub sigterm_received: Arc<AtomicBool>,
    pub sigint_received: Arc<AtomicBool>,
    pub sighup_received: Arc<AtomicBool>,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self {
            sigwinch_received: Arc::new(AtomicBool::new(false)),
            sigterm_received: Arc::new(AtomicBool::new(false)),
            sigint_received: Arc::new(AtomicBool::new(false)),
            sighup_received: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if the outer terminal was resized and clear the flag
    pub fn check_and_clear_sigwinch(&self) -> bool {
        self.sigwinch_received.swap(false, Ordering::SeqCst)
    }

    /// Name of the first termination request received, if any
    pub fn termination(&self) -> Option<&'static str> {
        if self.sigterm_received.load(Ordering::SeqCst) {
            Some("SIGTERM")
        } else if self.sigint_received.load(Ordering::SeqCst) {
            Some("SIGINT")
        } else if self.sighup_received.load(Ordering::SeqCst) {
            Some("SIGHUP")
        } else {
            None
        }
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{current_size, setup_signal_handlers};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{current_size, setup_signal_handlers};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_flags_creation() {
        let flags = SignalFlags::new();
        assert!(!flags.check_and_clear_sigwinch());
        assert_eq!(flags.termination(), None);
    }

    #[test]
    fn test_signal_flags_check_and_clear() {
        let flags = SignalFlags::new();

        flags.sigwinch_received.store(true, Ordering::SeqCst);
        assert!(flags.check_and_clear_sigwinch());
        assert!(!flags.check_and_clear_sigwinch());
    }

    #[test]
    fn test_termination_is_sticky_and_ordered() {
        let flags = SignalFlags::new();

        flags.sighup_received.store(true, Ordering::SeqCst);
        assert_eq!(flags.termination(), Some("SIGHUP"));
        flags.sigterm_received.store(true, Ordering::SeqCst);
        assert_eq!(flags.termination(), Some("SIGTERM"));
        assert_eq!(flags.termination(), Some("SIGTERM"));
    }
}
