//! Broker backend for Windows, built on the winpty agent.
//!
//! The agent process owns an emulated console and the target process. This
//! backend talks to it through the winpty API and two named pipes: one for
//! console input, one for console output.

pub mod embed;
#[cfg(windows)]
mod winpty;

use crate::error::Result;
use std::ffi::OsStr;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(windows)]
pub use self::windows_backend::WinptyBackend;

/// Append `arg` to a command line so that `CommandLineToArgvW` yields it
/// back unchanged.
fn quote_arg(arg: &str, cmdline: &mut String) {
    let needs_quotes =
        arg.is_empty() || arg.contains(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"'));
    if !needs_quotes {
        cmdline.push_str(arg);
        return;
    }

    cmdline.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                cmdline.extend(iter::repeat('\\').take(backslashes * 2 + 1));
                cmdline.push('"');
                backslashes = 0;
            }
            _ => {
                cmdline.extend(iter::repeat('\\').take(backslashes));
                cmdline.push(c);
                backslashes = 0;
            }
        }
    }
    // Backslashes before the closing quote must be doubled
    cmdline.extend(iter::repeat('\\').take(backslashes * 2));
    cmdline.push('"');
}

fn command_line(args: &[String]) -> String {
    let mut cmdline = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            cmdline.push(' ');
        }
        quote_arg(arg, &mut cmdline);
    }
    cmdline
}

#[cfg(windows)]
fn wide(s: &OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    s.encode_wide().collect()
}

#[cfg(not(windows))]
fn wide(s: &OsStr) -> Vec<u16> {
    s.to_string_lossy().encode_utf16().collect()
}

fn wide_nul(s: &OsStr) -> Vec<u16> {
    let mut buf = wide(s);
    buf.push(0);
    buf
}

/// `KEY=VALUE\0...\0\0` block for `CreateProcessW`
fn environment_block(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> Vec<u16> {
    let mut block = Vec::new();
    for (key, value) in env {
        block.extend(wide(key));
        block.push(u16::from(b'='));
        block.extend(wide(value));
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Run `terminate` with `killed` raised, so a waiter woken by the
/// termination reports it as forced. The flag drops back if the termination
/// failed and the process keeps running.
fn mark_terminated(killed: &AtomicBool, terminate: impl FnOnce() -> Result<()>) -> Result<()> {
    killed.store(true, Ordering::SeqCst);
    let result = terminate();
    if result.is_err() {
        killed.store(false, Ordering::SeqCst);
    }
    result
}

#[cfg(windows)]
mod windows_backend {
    use super::winpty::{
        Api, ErrorPtr, WINPTY_FLAG_COLOR_ESCAPES, WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN,
    };
    use super::{command_line, embed, environment_block, mark_terminated, wide_nul};
    use crate::backend::{Backend, SpawnRequest, WindowSize};
    use crate::error::{Error, Result};
    use crate::status::{ExitStatus, Signal};
    use std::ffi::{c_void, OsStr};
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use tracing::debug;
    use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, GetProcessId, TerminateProcess, WaitForSingleObject, INFINITE,
    };

    /// Live `winpty_t`, freed on drop
    struct Agent {
        api: &'static Api,
        ptr: *mut c_void,
    }

    // SAFETY: winpty_t calls are serialized by the owning Mutex
    unsafe impl Send for Agent {}

    impl Drop for Agent {
        fn drop(&mut self) {
            // SAFETY: ptr came from winpty_open and is freed only here
            unsafe { (self.api.free)(self.ptr) };
        }
    }

    fn handle(owned: &OwnedHandle) -> HANDLE {
        HANDLE(owned.as_raw_handle() as isize)
    }

    fn spawn_error(request: &SpawnRequest, message: String) -> Error {
        Error::spawn(request.program(), io::Error::new(io::ErrorKind::Other, message))
    }

    /// A process hosted by a winpty agent
    pub struct WinptyBackend {
        api: &'static Api,
        agent: Mutex<Option<Agent>>,
        conin: File,
        conout: File,
        process: OwnedHandle,
        _thread: Option<OwnedHandle>,
        pid: u32,
        killed: AtomicBool,
        status: Mutex<Option<ExitStatus>>,
    }

    impl WinptyBackend {
        fn lock_agent(&self) -> MutexGuard<'_, Option<Agent>> {
            self.agent.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn has_exited(&self) -> bool {
            // SAFETY: process handle stays open for the life of self
            unsafe { WaitForSingleObject(handle(&self.process), 0) == WAIT_OBJECT_0 }
        }

        fn open_agent(api: &'static Api, request: &SpawnRequest) -> Result<Agent> {
            let mut err: ErrorPtr = std::ptr::null_mut();
            // SAFETY: every winpty object created here is freed on all paths
            unsafe {
                let config = (api.config_new)(WINPTY_FLAG_COLOR_ESCAPES, &mut err);
                if config.is_null() {
                    return Err(spawn_error(request, api.take_error(err)));
                }
                (api.config_set_initial_size)(
                    config,
                    i32::from(request.size.cols),
                    i32::from(request.size.rows),
                );

                let ptr = (api.open)(config, &mut err);
                (api.config_free)(config);
                if ptr.is_null() {
                    return Err(spawn_error(request, api.take_error(err)));
                }
                Ok(Agent { api, ptr })
            }
        }
    }

    impl Backend for WinptyBackend {
        fn spawn(request: &SpawnRequest) -> Result<Self> {
            request.validate()?;
            let dir = embed::ensure_extracted()?;
            let api = Api::load(dir)?;
            let agent = Self::open_agent(api, request)?;

            // SAFETY: names are owned by the agent, which is alive here
            let (conin_name, conout_name) = unsafe {
                (
                    super::winpty::wide_to_string((api.conin_name)(agent.ptr)),
                    super::winpty::wide_to_string((api.conout_name)(agent.ptr)),
                )
            };
            let conin = OpenOptions::new()
                .write(true)
                .open(&conin_name)
                .map_err(|e| Error::spawn(request.program(), e))?;
            let conout = OpenOptions::new()
                .read(true)
                .open(&conout_name)
                .map_err(|e| Error::spawn(request.program(), e))?;

            let cmdline = wide_nul(OsStr::new(&command_line(&request.args)));
            let env = environment_block(&request.env);
            let cwd = request.cwd.as_ref().map(|dir| wide_nul(dir.as_os_str()));

            let mut err: ErrorPtr = std::ptr::null_mut();
            let mut process = HANDLE::default();
            let mut thread = HANDLE::default();
            let mut create_error = 0u32;

            // SAFETY: all buffers outlive the calls; spawn_config is freed
            let spawned = unsafe {
                let spawn_config = (api.spawn_config_new)(
                    WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN,
                    std::ptr::null(),
                    cmdline.as_ptr(),
                    cwd.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
                    env.as_ptr(),
                    &mut err,
                );
                if spawn_config.is_null() {
                    return Err(spawn_error(request, api.take_error(err)));
                }
                let ok = (api.spawn)(
                    agent.ptr,
                    spawn_config,
                    &mut process,
                    &mut thread,
                    &mut create_error,
                    &mut err,
                );
                (api.spawn_config_free)(spawn_config);
                ok.as_bool()
            };

            if !spawned {
                let message = api.take_error(err);
                return Err(if create_error != 0 {
                    Error::spawn(
                        request.program(),
                        io::Error::from_raw_os_error(create_error as i32),
                    )
                } else {
                    spawn_error(request, message)
                });
            }

            // SAFETY: winpty_spawn handed us ownership of both handles
            let process = unsafe { OwnedHandle::from_raw_handle(process.0 as RawHandle) };
            let thread = (!thread.is_invalid() && thread.0 != 0)
                .then(|| unsafe { OwnedHandle::from_raw_handle(thread.0 as RawHandle) });
            let pid = unsafe { GetProcessId(handle(&process)) };

            debug!(pid, conin = %conin_name, conout = %conout_name, "spawned child under winpty");

            Ok(Self {
                api,
                agent: Mutex::new(Some(agent)),
                conin,
                conout,
                process,
                _thread: thread,
                pid,
                killed: AtomicBool::new(false),
                status: Mutex::new(None),
            })
        }

        fn read(&self, buf: &mut [u8]) -> Result<usize> {
            match (&self.conout).read(buf) {
                Ok(n) => Ok(n),
                // The agent closes its end once the console shuts down
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
                Err(e) => Err(Error::Io(e)),
            }
        }

        fn write(&self, data: &[u8]) -> Result<usize> {
            Ok((&self.conin).write(data)?)
        }

        fn resize(&self, size: WindowSize) -> Result<()> {
            let agent = self.lock_agent();
            let agent = agent.as_ref().ok_or(Error::AlreadyClosed)?;
            let mut err: ErrorPtr = std::ptr::null_mut();
            // SAFETY: agent pointer is live while the lock is held
            let ok = unsafe {
                (self.api.set_size)(
                    agent.ptr,
                    i32::from(size.cols),
                    i32::from(size.rows),
                    &mut err,
                )
            };
            if ok.as_bool() {
                Ok(())
            } else {
                Err(Error::Windows(self.api.take_error(err)))
            }
        }

        fn pid(&self) -> u32 {
            self.pid
        }

        fn wait(&self) -> Result<ExitStatus> {
            let mut slot = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(status) = *slot {
                return Ok(status);
            }

            // SAFETY: process handle stays open for the life of self
            unsafe {
                if WaitForSingleObject(handle(&self.process), INFINITE) != WAIT_OBJECT_0 {
                    return Err(Error::Wait(io::Error::last_os_error()));
                }
                let mut code = 0u32;
                GetExitCodeProcess(handle(&self.process), &mut code)
                    .map_err(|e| Error::Wait(io::Error::from_raw_os_error(e.code().0)))?;

                let status = if self.killed.load(Ordering::SeqCst) {
                    ExitStatus::Terminated
                } else {
                    ExitStatus::Exited(code as i32)
                };
                *slot = Some(status);
                Ok(status)
            }
        }

        fn kill(&self) -> Result<()> {
            if self.has_exited() {
                return Ok(());
            }
            mark_terminated(&self.killed, || {
                // SAFETY: process handle stays open for the life of self
                unsafe { TerminateProcess(handle(&self.process), 1) }
                    .map_err(|e| Error::Windows(e.to_string()))
            })
        }

        fn signal(&self, _signal: Signal) -> Result<()> {
            // No signal delivery on this platform
            self.kill()
        }

        fn close(&self) -> Result<()> {
            // Freeing the agent tears down the console and breaks the pipes
            match self.lock_agent().take() {
                Some(agent) => {
                    drop(agent);
                    Ok(())
                }
                None => Err(Error::AlreadyClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_arguments_are_not_quoted() {
        assert_eq!(command_line(&args(&["cmd", "/c", "dir"])), "cmd /c dir");
    }

    #[test]
    fn test_quoting_rules() {
        assert_eq!(
            command_line(&args(&["echo", "hello world", ""])),
            r#"echo "hello world" """#
        );
        assert_eq!(command_line(&args(&[r#"say "hi""#])), r#""say \"hi\"""#);
        assert_eq!(command_line(&args(&[r"C:\dir with space\"])), r#""C:\dir with space\\""#);
        assert_eq!(command_line(&args(&[r"C:\plain\path"])), r"C:\plain\path");
    }

    #[test]
    fn test_environment_block_layout() {
        let env = vec![
            (OsString::from("A"), OsString::from("1")),
            (OsString::from("MYENV"), OsString::from("test")),
        ];
        let block = environment_block(&env);
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "A=1\0MYENV=test\0\0");

        assert_eq!(environment_block(&[]), vec![0, 0]);
    }

    #[test]
    fn test_failed_termination_is_not_reported_as_kill() {
        let killed = AtomicBool::new(false);
        let result = mark_terminated(&killed, || {
            assert!(killed.load(Ordering::SeqCst));
            Err(Error::AlreadyClosed)
        });
        assert!(matches!(result, Err(Error::AlreadyClosed)));
        assert!(!killed.load(Ordering::SeqCst));

        mark_terminated(&killed, || Ok(())).unwrap();
        assert!(killed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wide_nul_terminates() {
        assert_eq!(wide_nul(OsStr::new("ab")), vec![97, 98, 0]);
    }
}
