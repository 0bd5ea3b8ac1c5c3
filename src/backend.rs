//! The seam between the generic session state machine and a platform
//! realization of a pseudo-terminal.

use crate::error::Result;
use crate::status::{ExitStatus, Signal};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(crate::error::Error::InvalidSize { cols, rows });
        }
        Ok(Self { cols, rows })
    }
}

/// Everything a backend needs to launch the child process
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// `args[0]` is the program, the rest its arguments
    pub args: Vec<String>,
    /// `None` keeps the caller's working directory
    pub cwd: Option<PathBuf>,
    /// Resolved environment, one entry per key
    pub env: Vec<(OsString, OsString)>,
    pub size: WindowSize,
}

impl SpawnRequest {
    /// `args[0]`, or `""` when no arguments were given
    pub fn program(&self) -> &str {
        self.args.first().map_or("", String::as_str)
    }

    /// Reject a request with nothing to run
    pub fn validate(&self) -> Result<()> {
        if self.args.is_empty() {
            return Err(crate::error::Error::InvalidArguments(
                "no command specified".to_string(),
            ));
        }
        Ok(())
    }

    /// Value of `key` in the child's environment
    pub fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .find(|(k, _)| crate::session::same_env_key(k, OsStr::new(key)))
            .map(|(_, v)| v.as_os_str())
    }
}

/// A live pseudo-terminal with exactly one child process attached.
///
/// Every method takes `&self`: reads, waits and kills are issued from
/// different threads at the same time, so implementations synchronize
/// internally and must not hold a lock across a blocking call that
/// another operation depends on.
pub trait Backend: Send + Sync + Sized {
    /// Launch the child and return once it is confirmed running.
    fn spawn(request: &SpawnRequest) -> Result<Self>;

    /// Read child output. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write to the child's terminal input.
    fn write(&self, data: &[u8]) -> Result<usize>;

    fn resize(&self, size: WindowSize) -> Result<()>;

    fn pid(&self) -> u32;

    /// Block until the child exits. Repeated calls return the same status.
    fn wait(&self) -> Result<ExitStatus>;

    fn kill(&self) -> Result<()>;

    fn signal(&self, signal: Signal) -> Result<()>;

    /// Release what can be released eagerly. Descriptors still in use by
    /// a concurrent operation are freed when the backend is dropped.
    fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn request(args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: vec![(OsString::from("PATH"), OsString::from("/bin"))],
            size: WindowSize::new(80, 24).unwrap(),
        }
    }

    #[test]
    fn test_program_of_empty_request() {
        let empty = request(&[]);
        assert_eq!(empty.program(), "");
        assert!(matches!(empty.validate(), Err(Error::InvalidArguments(_))));

        let echo = request(&["echo", "hi"]);
        assert_eq!(echo.program(), "echo");
        assert!(echo.validate().is_ok());
    }

    #[test]
    fn test_env_var_lookup() {
        let req = request(&["true"]);
        assert_eq!(req.env_var("PATH"), Some(OsStr::new("/bin")));
        assert_eq!(req.env_var("HOME"), None);
    }
}
