use std::io;
use thiserror::Error;

/// Return codes used by the `vterm` command line front end
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    NoError = 0,
    InvalidArguments = 1,
    RuntimeError = 3,
    CannotExecute = 126,
    CommandNotFound = 127,
}

impl ReturnCode {
    pub fn as_exit_code(self) -> i32 {
        self as i32
    }
}

/// Main error type for console session operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("process not started")]
    NotStarted,

    #[error("process already started")]
    AlreadyStarted,

    #[error("nothing to close: process was never started")]
    NothingToClose,

    #[error("console already closed")]
    AlreadyClosed,

    #[error("invalid console size {cols}x{rows}: columns and rows must be positive")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid environment entry {0:?}: expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to extract embedded dependencies: {0}")]
    Extraction(String),

    #[cfg(unix)]
    #[error("system error: {0}")]
    System(#[from] nix::Error),

    #[cfg(windows)]
    #[error("windows error: {0}")]
    Windows(String),
}

impl Error {
    pub(crate) fn spawn(command: &str, source: io::Error) -> Self {
        Error::Spawn {
            command: command.to_string(),
            source,
        }
    }

    /// Convert error to the appropriate return code
    pub fn to_return_code(&self) -> ReturnCode {
        match self {
            Error::InvalidSize { .. } | Error::InvalidArguments(_) | Error::InvalidEnv(_) => {
                ReturnCode::InvalidArguments
            }
            Error::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                ReturnCode::CommandNotFound
            }
            Error::Spawn { .. } => ReturnCode::CannotExecute,
            _ => ReturnCode::RuntimeError,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.to_return_code().as_exit_code()
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::NotStarted | Error::NothingToClose => io::ErrorKind::NotConnected,
            Error::AlreadyClosed => io::ErrorKind::BrokenPipe,
            Error::InvalidSize { .. }
            | Error::InvalidArguments(_)
            | Error::InvalidEnv(_) => io::ErrorKind::InvalidInput,
            Error::Spawn { source, .. } | Error::Wait(source) => source.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

/// Result type alias for console operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

impl From<Error> for i32 {
    fn from(error: Error) -> Self {
        error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_not_found_maps_to_127() {
        let err = Error::spawn("nope", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.exit_code(), 127);
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_io_conversion_keeps_inner_error() {
        let err: io::Error = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")).into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = Error::NotStarted.into();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
