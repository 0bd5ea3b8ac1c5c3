//! Session lifecycle shared by all backends.
//!
//! `Created -> Configured* -> Running -> Exited -> Closed`

use crate::backend::{Backend, SpawnRequest, WindowSize};
use crate::console::Console;
use crate::error::{Error, Result};
use crate::status::{ExitStatus, Signal};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Ordered `KEY=VALUE` list, seeded from the caller's environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    entries: Vec<(OsString, OsString)>,
}

impl Environment {
    /// Snapshot of the current process environment
    pub fn inherit() -> Self {
        Self {
            entries: std::env::vars_os().collect(),
        }
    }

    /// Append a `KEY=VALUE` entry. Later entries override earlier ones.
    pub fn push(&mut self, entry: &str) -> Result<()> {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                self.entries.push((key.into(), value.into()));
                Ok(())
            }
            _ => Err(Error::InvalidEnv(entry.to_string())),
        }
    }

    /// One entry per key: the last value wins, first-seen order is kept.
    pub fn resolve(&self) -> Vec<(OsString, OsString)> {
        let mut resolved: Vec<(OsString, OsString)> = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            match resolved.iter_mut().find(|(k, _)| same_env_key(k, key)) {
                Some(slot) => slot.1 = value.clone(),
                None => resolved.push((key.clone(), value.clone())),
            }
        }
        resolved
    }
}

#[cfg(unix)]
pub(crate) fn same_env_key(a: &OsStr, b: &OsStr) -> bool {
    a == b
}

// Windows environment names are case-insensitive
#[cfg(windows)]
pub(crate) fn same_env_key(a: &OsStr, b: &OsStr) -> bool {
    a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
}

enum Phase<B> {
    Created,
    Configured,
    /// `start` is launching the child without holding the lock
    Starting,
    Running(Arc<B>),
    Exited(Arc<B>, ExitStatus),
    Closed,
}

impl<B> Phase<B> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Configured => "configured",
            Phase::Starting => "starting",
            Phase::Running(_) => "running",
            Phase::Exited(..) => "exited",
            Phase::Closed => "closed",
        }
    }
}

struct Inner<B> {
    size: WindowSize,
    cwd: Option<PathBuf>,
    env: Environment,
    phase: Phase<B>,
}

/// A console session driven by backend `B`.
///
/// The session lock only guards state transitions; it is released before
/// any call that can block (spawning, reads, waits, resizes), so one thread
/// can drain output while another waits for the process and a third kills
/// it.
pub struct Session<B: Backend> {
    inner: Mutex<Inner<B>>,
}

impl<B: Backend> Session<B> {
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        let size = WindowSize::new(cols, rows)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                size,
                cwd: None,
                env: Environment::inherit(),
                phase: Phase::Created,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Backend handle for operations that require a started session
    fn backend(&self) -> Result<Arc<B>> {
        match &self.lock().phase {
            Phase::Created | Phase::Configured | Phase::Starting => Err(Error::NotStarted),
            Phase::Running(backend) | Phase::Exited(backend, _) => Ok(Arc::clone(backend)),
            Phase::Closed => Err(Error::AlreadyClosed),
        }
    }

    /// Lock for a pre-start configuration change
    fn configure(&self) -> Result<MutexGuard<'_, Inner<B>>> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Created | Phase::Configured => {
                inner.phase = Phase::Configured;
                Ok(inner)
            }
            Phase::Closed => Err(Error::AlreadyClosed),
            _ => Err(Error::AlreadyStarted),
        }
    }
}

impl<B: Backend> Console for Session<B> {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.backend()?.read(buf)?;
        trace!(bytes = n, "console read");
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let n = self.backend()?.write(data)?;
        trace!(bytes = n, "console write");
        Ok(n)
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.phase, Phase::Closed) {
            Phase::Created | Phase::Configured | Phase::Starting => Err(Error::NothingToClose),
            Phase::Closed => Err(Error::AlreadyClosed),
            Phase::Running(backend) | Phase::Exited(backend, _) => {
                debug!(pid = backend.pid(), "closing console");
                backend.close()
            }
        }
    }

    fn set_size(&self, cols: u16, rows: u16) -> Result<()> {
        let size = WindowSize::new(cols, rows)?;
        let mut inner = self.lock();
        let live = match &inner.phase {
            Phase::Running(backend) | Phase::Exited(backend, _) => Some(Arc::clone(backend)),
            Phase::Closed => return Err(Error::AlreadyClosed),
            Phase::Created | Phase::Configured | Phase::Starting => None,
        };

        let Some(backend) = live else {
            // A size set while starting is applied once the child is up
            if !matches!(inner.phase, Phase::Starting) {
                inner.phase = Phase::Configured;
            }
            inner.size = size;
            return Ok(());
        };
        drop(inner);

        debug!(cols, rows, "resizing console");
        backend.resize(size)?;
        self.lock().size = size;
        Ok(())
    }

    fn size(&self) -> Result<(u16, u16)> {
        let size = self.lock().size;
        Ok((size.cols, size.rows))
    }

    fn start(&self, args: &[String]) -> Result<()> {
        if args.is_empty() {
            return Err(Error::InvalidArguments("no command specified".to_string()));
        }

        let (request, previous) = {
            let mut inner = self.lock();
            let previous = match inner.phase {
                Phase::Created => Phase::Created,
                Phase::Configured => Phase::Configured,
                Phase::Closed => return Err(Error::AlreadyClosed),
                _ => return Err(Error::AlreadyStarted),
            };
            let request = SpawnRequest {
                args: args.to_vec(),
                cwd: inner.cwd.clone(),
                env: inner.env.resolve(),
                size: inner.size,
            };
            inner.phase = Phase::Starting;
            (request, previous)
        };

        let spawned = B::spawn(&request);

        let mut inner = self.lock();
        let backend = match spawned {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                if matches!(inner.phase, Phase::Starting) {
                    inner.phase = previous;
                }
                return Err(e);
            }
        };

        if !matches!(inner.phase, Phase::Starting) {
            // Closed while the child was launching
            drop(inner);
            debug!(pid = backend.pid(), "console closed during start");
            if let Err(e) = backend.close() {
                warn!(error = %e, "failed to close abandoned backend");
            }
            return Err(Error::AlreadyClosed);
        }

        inner.phase = Phase::Running(Arc::clone(&backend));
        let size = inner.size;
        drop(inner);
        debug!(pid = backend.pid(), command = ?args, "console started");

        if size != request.size {
            if let Err(e) = backend.resize(size) {
                warn!(error = %e, "failed to apply size set during start");
            }
        }
        Ok(())
    }

    fn wait(&self) -> Result<ExitStatus> {
        let backend = match &self.lock().phase {
            Phase::Exited(_, status) => return Ok(*status),
            Phase::Running(backend) => Arc::clone(backend),
            Phase::Created | Phase::Configured | Phase::Starting => return Err(Error::NotStarted),
            Phase::Closed => return Err(Error::AlreadyClosed),
        };
        let status = backend.wait()?;

        let mut inner = self.lock();
        let current = matches!(&inner.phase, Phase::Running(running) if Arc::ptr_eq(running, &backend));
        if current {
            debug!(pid = backend.pid(), %status, "console process exited");
            inner.phase = Phase::Exited(backend, status);
        }
        Ok(status)
    }

    fn pid(&self) -> Result<u32> {
        Ok(self.backend()?.pid())
    }

    fn kill(&self) -> Result<()> {
        let backend = self.backend()?;
        debug!(pid = backend.pid(), "killing console process");
        backend.kill()
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let backend = self.backend()?;
        debug!(pid = backend.pid(), %signal, "signaling console process");
        backend.signal(signal)
    }

    fn set_cwd(&self, path: &Path) -> Result<()> {
        self.configure()?.cwd = Some(path.to_path_buf());
        Ok(())
    }

    fn set_env(&self, entries: &[String]) -> Result<()> {
        let mut inner = self.configure()?;
        // Validate everything first so a bad entry leaves the list untouched
        let mut env = inner.env.clone();
        for entry in entries {
            env.push(entry)?;
        }
        inner.env = env;
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("size", &inner.size)
            .field("cwd", &inner.cwd)
            .field("phase", &inner.phase.name())
            .finish()
    }
}

impl<B: Backend> io::Read for &Session<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Console::read(*self, buf).map_err(io::Error::from)
    }
}

impl<B: Backend> io::Read for Session<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl<B: Backend> io::Write for &Session<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Console::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: Backend> io::Write for Session<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
