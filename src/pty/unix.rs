//! Native pseudo-terminal backend for Unix.

use crate::backend::{Backend, SpawnRequest, WindowSize};
use crate::error::{Error, Result};
use crate::status::{ExitStatus, Signal};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, killpg, sigprocmask, SigHandler, SigSet, SigmaskHow};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult, Pid};
use nix::{ioctl_read_bad, ioctl_write_int_bad, ioctl_write_ptr_bad};
use std::ffi::{CString, OsStr, OsString};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);
ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// Signals whose disposition is reset to the default in the child
const RESET_SIGNALS: [signal::Signal; 7] = [
    signal::SIGHUP,
    signal::SIGINT,
    signal::SIGQUIT,
    signal::SIGPIPE,
    signal::SIGTERM,
    signal::SIGCHLD,
    signal::SIGWINCH,
];

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// How long a hung-up child gets to exit before it is killed
const HANGUP_GRACE_PERIOD: Duration = Duration::from_millis(100);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A child process running on the slave side of a kernel pseudo-terminal.
/// The master side is the session's byte stream.
pub struct PtyBackend {
    master: OwnedFd,
    pid: Pid,
    status: Mutex<Option<ExitStatus>>,
    reaped: AtomicBool,
}

impl PtyBackend {
    fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    fn lock_status(&self) -> MutexGuard<'_, Option<ExitStatus>> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, slot: &mut Option<ExitStatus>, status: ExitStatus) {
        self.reaped.store(true, Ordering::SeqCst);
        *slot = Some(status);
    }

    /// Collect the child if it already exited. Skipped when a waiter is
    /// blocked, since that waiter will reap it.
    fn reap_if_exited(&self) -> bool {
        let mut slot = match self.status.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if slot.is_some() {
            return true;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => match decode(status) {
                Some(status) => {
                    self.record(&mut slot, status);
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(pid = self.pid.as_raw(), error = %e, "non-blocking reap failed");
                false
            }
        }
    }

    fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst) || self.reap_if_exited()
    }

    /// Hang up a running child like a closed terminal would, then kill its
    /// process group if it is still around after a grace period. Returns
    /// once the child has been reaped.
    fn terminate(&self) -> Result<()> {
        if self.is_reaped() {
            return Ok(());
        }

        debug!(pid = self.pid.as_raw(), "hanging up running child");
        match self.signal_group(signal::SIGHUP) {
            Ok(()) | Err(Error::System(Errno::ESRCH)) => {}
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + HANGUP_GRACE_PERIOD;
        while Instant::now() < deadline {
            if self.is_reaped() {
                return Ok(());
            }
            thread::sleep(REAP_POLL_INTERVAL);
        }

        warn!(pid = self.pid.as_raw(), "child survived hangup, sending SIGKILL");
        match self.signal_group(signal::SIGKILL) {
            Ok(()) | Err(Error::System(Errno::ESRCH)) => {}
            Err(e) => return Err(e),
        }
        // Blocks until a concurrent waiter, if any, has collected the status
        self.wait().map(|_| ())
    }

    fn signal_group(&self, sig: signal::Signal) -> Result<()> {
        // The child leads its own session, so its pid is the group id
        match killpg(self.pid, sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => signal::kill(self.pid, sig).map_err(Error::from),
            Err(e) => Err(Error::from(e)),
        }
    }
}

fn decode(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::Signaled(sig.into())),
        _ => None,
    }
}

fn winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| Error::InvalidArguments(format!("{} contains a NUL byte", what)))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate `program` the way `execvp` would, but against the child's `PATH`.
fn resolve_program(program: &str, path_var: Option<&OsStr>) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }

    let fallback = std::env::var_os("PATH").unwrap_or_else(|| OsString::from(DEFAULT_PATH));
    let search = path_var.unwrap_or(fallback.as_os_str());
    std::env::split_paths(search)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(program)
            } else {
                dir.join(program)
            }
        })
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| Error::spawn(program, io::Error::from(io::ErrorKind::NotFound)))
}

/// Everything the forked child needs, prepared before `fork` so the child
/// never allocates.
struct ExecPlan {
    program: CString,
    // Owners of the bytes that `argv_ptrs`/`envp_ptrs` point into
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
}

impl ExecPlan {
    fn new(request: &SpawnRequest) -> Result<Self> {
        request.validate()?;
        let path_var = request.env_var("PATH");
        let program = resolve_program(request.program(), path_var)?;
        let program = cstring(program.as_os_str().as_bytes(), "program path")?;

        let argv = request
            .args
            .iter()
            .map(|arg| cstring(arg.as_bytes(), "argument"))
            .collect::<Result<Vec<_>>>()?;

        let envp = request
            .env
            .iter()
            .map(|(key, value)| {
                let mut entry = key.clone().into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                cstring(&entry, "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;

        let cwd = request
            .cwd
            .as_ref()
            .map(|dir| cstring(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        let argv_ptrs = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            program,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
        })
    }
}

/// Runs in the forked child. Returns only on failure.
fn exec_child(slave: RawFd, plan: &ExecPlan) -> Errno {
    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
        return e;
    }
    for sig in RESET_SIGNALS {
        // SAFETY: SIG_DFL installs no handler code
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }

    if let Err(e) = setsid() {
        return e;
    }

    // SAFETY: slave is a valid open terminal descriptor
    if let Err(e) = unsafe { tiocsctty(slave, 0) } {
        return e;
    }

    for fd in 0..=2 {
        if let Err(e) = dup2(slave, fd) {
            return e;
        }
        // dup2 onto itself keeps FD_CLOEXEC
        if let Err(e) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())) {
            return e;
        }
    }

    if let Some(dir) = &plan.cwd {
        if let Err(e) = chdir(dir.as_c_str()) {
            return e;
        }
    }

    // SAFETY: both pointer arrays are NUL-terminated and backed by `plan`
    unsafe {
        libc::execve(
            plan.program.as_ptr(),
            plan.argv_ptrs.as_ptr(),
            plan.envp_ptrs.as_ptr(),
        );
    }
    Errno::last()
}

impl Backend for PtyBackend {
    fn spawn(request: &SpawnRequest) -> Result<Self> {
        let plan = ExecPlan::new(request)?;

        // Held until both ends are close-on-exec and our fork is done, so
        // no sibling session's child inherits this terminal
        let spawn_guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let pty = openpty(&winsize(request.size), None).map_err(|e| {
            Error::spawn(request.program(), io::Error::from(e))
        })?;
        set_cloexec(pty.master.as_raw_fd())?;
        set_cloexec(pty.slave.as_raw_fd())?;

        // Closed by execve on success; carries errno otherwise
        let (mut status_rx, status_tx) = UnixStream::pair()?;

        // SAFETY: the child only makes async-signal-safe calls before execve
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let errno = exec_child(pty.slave.as_raw_fd(), &plan) as i32;
                let bytes = errno.to_ne_bytes();
                // SAFETY: writing a stack buffer to an open descriptor
                unsafe {
                    libc::write(
                        status_tx.as_raw_fd(),
                        bytes.as_ptr() as *const libc::c_void,
                        bytes.len(),
                    );
                }
                unsafe { libc::_exit(127) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(spawn_guard);
                drop(pty.slave);
                drop(status_tx);

                let mut errno = [0u8; 4];
                let failure = match status_rx.read_exact(&mut errno) {
                    Ok(()) => Some(io::Error::from_raw_os_error(i32::from_ne_bytes(errno))),
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
                    Err(e) => Some(e),
                };

                if let Some(source) = failure {
                    let _ = signal::kill(child, signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(Error::spawn(request.program(), source));
                }

                debug!(
                    pid = child.as_raw(),
                    cols = request.size.cols,
                    rows = request.size.rows,
                    "spawned child on pty"
                );

                Ok(Self {
                    master: pty.master,
                    pid: child,
                    status: Mutex::new(None),
                    reaped: AtomicBool::new(false),
                })
            }
            Err(e) => Err(Error::spawn(request.program(), io::Error::from(e))),
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match nix::unistd::read(self.master_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                // Linux reports a hung-up slave side as EIO
                Err(Errno::EIO) => return Ok(0),
                Err(e) => return Err(Error::Io(io::Error::from(e))),
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        loop {
            match nix::unistd::write(self.master_fd(), data) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Io(io::Error::from(e))),
            }
        }
    }

    fn resize(&self, size: WindowSize) -> Result<()> {
        let ws = winsize(size);
        // SAFETY: master is an open pty descriptor and `ws` outlives the call
        unsafe { tiocswinsz(self.master_fd(), &ws as *const Winsize) }?;

        if !self.reaped.load(Ordering::SeqCst) {
            match killpg(self.pid, signal::SIGWINCH) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn wait(&self) -> Result<ExitStatus> {
        let mut slot = self.lock_status();
        if let Some(status) = *slot {
            return Ok(status);
        }

        let status = loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(status) = decode(status) {
                        break status;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Wait(io::Error::from(e))),
            }
        };

        self.record(&mut slot, status);
        Ok(status)
    }

    fn kill(&self) -> Result<()> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.signal_group(signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let sig = signal::Signal::try_from(sig)?;
        signal::kill(self.pid, sig)?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.terminate()
    }
}

impl Drop for PtyBackend {
    fn drop(&mut self) {
        // The master descriptor is closed by OwnedFd
        if let Err(e) = self.terminate() {
            warn!(pid = self.pid.as_raw(), error = %e, "failed to terminate child on drop");
        }
    }
}

/// Geometry of the terminal behind `fd`, if it is one
pub fn terminal_size<F: AsRawFd>(fd: &F) -> Option<WindowSize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: `ws` is a valid out-pointer for the duration of the call
    unsafe { tiocgwinsz(fd.as_raw_fd(), &mut ws as *mut Winsize) }.ok()?;

    WindowSize::new(ws.ws_col, ws.ws_row).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Environment;

    fn request(args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: Environment::inherit().resolve(),
            size: WindowSize { cols: 80, rows: 24 },
        }
    }

    fn read_all(backend: &PtyBackend) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match backend.read(&mut buf).unwrap() {
                0 => return out,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(
            resolve_program("./local", None).unwrap(),
            PathBuf::from("./local")
        );
        let sh = resolve_program("sh", Some(OsStr::new("/nonexistent:/bin:/usr/bin"))).unwrap();
        assert!(sh.ends_with("sh"));
        assert!(matches!(
            resolve_program("sh", Some(OsStr::new("/nonexistent"))),
            Err(Error::Spawn { .. })
        ));
    }

    #[test]
    fn test_spawn_echo_and_read() {
        let backend = PtyBackend::spawn(&request(&["echo", "hello pty"])).unwrap();
        assert!(backend.pid() > 0);

        let output = read_all(&backend);
        assert!(String::from_utf8_lossy(&output).contains("hello pty"));
        assert_eq!(backend.wait().unwrap(), ExitStatus::Exited(0));
        // Cached
        assert_eq!(backend.wait().unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn test_exit_code_is_reported() {
        let backend = PtyBackend::spawn(&request(&["sh", "-c", "exit 7"])).unwrap();
        read_all(&backend);
        assert_eq!(backend.wait().unwrap(), ExitStatus::Exited(7));
    }

    #[test]
    fn test_missing_program_fails_spawn() {
        let err = PtyBackend::spawn(&request(&["definitely-not-a-real-program-vterm"]))
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn test_exec_failure_is_reported_through_status_channel() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("not-executable");
        std::fs::write(&script, "#!/bin/sh\necho nope\n").unwrap();

        let err = PtyBackend::spawn(&request(&[script.to_str().unwrap()]))
            .err()
            .unwrap();
        match err {
            Error::Spawn { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_bad_cwd_fails_spawn() {
        let mut req = request(&["pwd"]);
        req.cwd = Some(PathBuf::from("/nonexistent/vterm/dir"));
        assert!(matches!(PtyBackend::spawn(&req), Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_signal_terminates_child() {
        let backend = PtyBackend::spawn(&request(&["sleep", "3600"])).unwrap();
        backend.signal(Signal::Terminate).unwrap();
        assert_eq!(
            backend.wait().unwrap(),
            ExitStatus::Signaled(Signal::Terminate)
        );
        // No-op once reaped
        backend.kill().unwrap();
    }

    fn read_until(backend: &PtyBackend, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&out).contains(needle) {
            match backend.read(&mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn assert_reaped(pid: u32) {
        let pid = Pid::from_raw(pid as i32);
        assert_eq!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD),
            "child {} was left behind",
            pid
        );
    }

    #[test]
    fn test_empty_arguments_rejected() {
        assert!(matches!(
            PtyBackend::spawn(&request(&[])),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_close_reaps_running_child() {
        let backend = PtyBackend::spawn(&request(&["sleep", "3600"])).unwrap();
        let pid = backend.pid();
        backend.close().unwrap();
        assert_reaped(pid);
        // Hangup normally, Kill if the grace period ran out first
        assert!(backend.wait().unwrap().signal().is_some());
    }

    #[test]
    fn test_close_after_kill_reaps_without_wait() {
        let backend = PtyBackend::spawn(&request(&["sleep", "3600"])).unwrap();
        let pid = backend.pid();
        backend.kill().unwrap();
        backend.close().unwrap();
        assert_reaped(pid);
    }

    #[test]
    fn test_close_kills_child_ignoring_hangup() {
        let backend =
            PtyBackend::spawn(&request(&["sh", "-c", "trap '' HUP; echo ready; sleep 30"]))
                .unwrap();
        let pid = backend.pid();
        read_until(&backend, "ready");

        thread::scope(|scope| {
            let reader = scope.spawn(|| read_all(&backend));
            let started = Instant::now();
            backend.close().unwrap();
            assert!(started.elapsed() < Duration::from_secs(5));
            reader.join().unwrap();
        });

        assert_reaped(pid);
        assert_eq!(backend.wait().unwrap(), ExitStatus::Signaled(Signal::Kill));
    }

    #[test]
    fn test_close_waits_behind_concurrent_waiter() {
        let backend = PtyBackend::spawn(&request(&["sleep", "3600"])).unwrap();
        let pid = backend.pid();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| backend.wait());
            thread::sleep(Duration::from_millis(50));
            backend.close().unwrap();
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_reaped(pid);
    }

    #[test]
    fn test_drop_reaps_running_child() {
        let backend = PtyBackend::spawn(&request(&["sleep", "3600"])).unwrap();
        let pid = backend.pid();
        drop(backend);
        assert_reaped(pid);
    }

    #[test]
    fn test_concurrent_spawns_do_not_share_terminals() {
        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..3 {
                        let backend = PtyBackend::spawn(&request(&["sleep", "1"])).unwrap();
                        read_all(&backend);
                        backend.wait().unwrap();
                    }
                });
            }
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        let backend = PtyBackend::spawn(&request(&["true"])).unwrap();
                        let started = Instant::now();
                        read_all(&backend);
                        // A terminal leaked into a sleeping sibling would
                        // hold EOF back for about a second
                        assert!(started.elapsed() < Duration::from_millis(800));
                        backend.wait().unwrap();
                    }
                });
            }
        });
    }

    #[test]
    fn test_nul_in_argument_rejected() {
        assert!(matches!(
            PtyBackend::spawn(&request(&["echo", "a\0b"])),
            Err(Error::InvalidArguments(_))
        ));
    }
}
