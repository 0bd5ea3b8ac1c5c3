//! Process termination model shared by every backend.

use std::fmt;

/// A signal that can be delivered to the process running in a console.
///
/// On Windows there is no signal delivery; every variant is approximated by
/// forced termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Quit,
    Kill,
    User1,
    User2,
    Terminate,
    WindowChange,
    /// Any other platform signal number
    Other(i32),
}

impl Signal {
    /// Conventional short description, as printed by shells for a
    /// signaled child ("killed", "terminated", ...).
    pub fn description(&self) -> String {
        match self {
            Signal::Hangup => "hangup".to_string(),
            Signal::Interrupt => "interrupt".to_string(),
            Signal::Quit => "quit".to_string(),
            Signal::Kill => "killed".to_string(),
            Signal::User1 => "user defined signal 1".to_string(),
            Signal::User2 => "user defined signal 2".to_string(),
            Signal::Terminate => "terminated".to_string(),
            Signal::WindowChange => "window changed".to_string(),
            Signal::Other(n) => format!("signal {}", n),
        }
    }
}

#[cfg(unix)]
impl From<nix::sys::signal::Signal> for Signal {
    fn from(signal: nix::sys::signal::Signal) -> Self {
        use nix::sys::signal::Signal as Nix;
        match signal {
            Nix::SIGHUP => Signal::Hangup,
            Nix::SIGINT => Signal::Interrupt,
            Nix::SIGQUIT => Signal::Quit,
            Nix::SIGKILL => Signal::Kill,
            Nix::SIGUSR1 => Signal::User1,
            Nix::SIGUSR2 => Signal::User2,
            Nix::SIGTERM => Signal::Terminate,
            Nix::SIGWINCH => Signal::WindowChange,
            other => Signal::Other(other as i32),
        }
    }
}

#[cfg(unix)]
impl TryFrom<Signal> for nix::sys::signal::Signal {
    type Error = nix::Error;

    fn try_from(signal: Signal) -> Result<Self, Self::Error> {
        use nix::sys::signal::Signal as Nix;
        Ok(match signal {
            Signal::Hangup => Nix::SIGHUP,
            Signal::Interrupt => Nix::SIGINT,
            Signal::Quit => Nix::SIGQUIT,
            Signal::Kill => Nix::SIGKILL,
            Signal::User1 => Nix::SIGUSR1,
            Signal::User2 => Nix::SIGUSR2,
            Signal::Terminate => Nix::SIGTERM,
            Signal::WindowChange => Nix::SIGWINCH,
            Signal::Other(n) => Nix::try_from(n)?,
        })
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// How the process attached to a console finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited on its own with the given code
    Exited(i32),
    /// The process was terminated by a signal (Unix)
    Signaled(Signal),
    /// The process was forcibly terminated through the broker. The platform
    /// offers no signal number, so this is reported as "signal -1".
    Terminated,
}

impl ExitStatus {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal, if any
    pub fn signal(&self) -> Option<Signal> {
        match self {
            ExitStatus::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// True when the process was forcibly killed, whatever the backend.
    pub fn is_killed(&self) -> bool {
        matches!(self, ExitStatus::Signaled(Signal::Kill) | ExitStatus::Terminated)
    }

    /// Shell-style exit code: the code itself, or 128 + signal number.
    #[cfg(unix)]
    pub fn shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => nix::sys::signal::Signal::try_from(*signal)
                .map(|s| 128 + s as i32)
                .unwrap_or(255),
            ExitStatus::Terminated => 128 + libc::SIGKILL,
        }
    }

    /// Shell-style exit code: the code itself, or 1 for forced termination.
    #[cfg(windows)]
    pub fn shell_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            _ => 1,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit status {}", code),
            ExitStatus::Signaled(signal) => write!(f, "{}", signal),
            ExitStatus::Terminated => f.write_str("signal -1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_shell_wording() {
        assert_eq!(ExitStatus::Exited(2).to_string(), "exit status 2");
        assert_eq!(ExitStatus::Signaled(Signal::Kill).to_string(), "killed");
        assert_eq!(ExitStatus::Signaled(Signal::Terminate).to_string(), "terminated");
        assert_eq!(ExitStatus::Terminated.to_string(), "signal -1");
    }

    #[test]
    fn test_killed_classification() {
        assert!(ExitStatus::Signaled(Signal::Kill).is_killed());
        assert!(ExitStatus::Terminated.is_killed());
        assert!(!ExitStatus::Signaled(Signal::Interrupt).is_killed());
        assert!(!ExitStatus::Exited(0).is_killed());
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        assert_eq!(ExitStatus::Terminated.signal(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_nix_signal_conversion() {
        use nix::sys::signal::Signal as Nix;

        assert_eq!(Signal::from(Nix::SIGKILL), Signal::Kill);
        assert_eq!(Nix::try_from(Signal::Terminate).unwrap(), Nix::SIGTERM);
        assert_eq!(Nix::try_from(Signal::Other(libc::SIGCONT)).unwrap(), Nix::SIGCONT);
        assert!(Nix::try_from(Signal::Other(-1)).is_err());
        assert_eq!(ExitStatus::Signaled(Signal::Kill).shell_code(), 137);
    }
}
