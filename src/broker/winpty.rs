//! Dynamically loaded winpty API.
//!
//! `winpty.dll` is loaded from the extraction directory, next to
//! `winpty-agent.exe`, which the DLL launches as the console broker.

use crate::error::{Error, Result};
use std::ffi::c_void;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;
use windows::core::{HSTRING, PCSTR, PCWSTR};
use windows::Win32::Foundation::{BOOL, HANDLE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

pub type ErrorPtr = *mut c_void;

pub const WINPTY_FLAG_COLOR_ESCAPES: u64 = 0x4;
pub const WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN: u64 = 0x1;

/// Entry points of `winpty.dll`
pub struct Api {
    pub error_msg: unsafe extern "C" fn(ErrorPtr) -> *const u16,
    pub error_free: unsafe extern "C" fn(ErrorPtr),
    pub config_new: unsafe extern "C" fn(u64, *mut ErrorPtr) -> *mut c_void,
    pub config_free: unsafe extern "C" fn(*mut c_void),
    pub config_set_initial_size: unsafe extern "C" fn(*mut c_void, i32, i32),
    pub open: unsafe extern "C" fn(*const c_void, *mut ErrorPtr) -> *mut c_void,
    pub conin_name: unsafe extern "C" fn(*mut c_void) -> *const u16,
    pub conout_name: unsafe extern "C" fn(*mut c_void) -> *const u16,
    pub spawn_config_new: unsafe extern "C" fn(
        u64,
        *const u16,
        *const u16,
        *const u16,
        *const u16,
        *mut ErrorPtr,
    ) -> *mut c_void,
    pub spawn_config_free: unsafe extern "C" fn(*mut c_void),
    pub spawn: unsafe extern "C" fn(
        *mut c_void,
        *const c_void,
        *mut HANDLE,
        *mut HANDLE,
        *mut u32,
        *mut ErrorPtr,
    ) -> BOOL,
    pub set_size: unsafe extern "C" fn(*mut c_void, i32, i32, *mut ErrorPtr) -> BOOL,
    pub free: unsafe extern "C" fn(*mut c_void),
}

static API: OnceLock<std::result::Result<Api, String>> = OnceLock::new();

macro_rules! symbol {
    ($module:expr, $name:literal) => {{
        let proc = GetProcAddress($module, PCSTR(concat!($name, "\0").as_ptr()))
            .ok_or_else(|| format!("winpty.dll does not export {}", $name))?;
        std::mem::transmute(proc)
    }};
}

impl Api {
    /// Load the API from `dir`, once per process.
    pub fn load(dir: &Path) -> Result<&'static Api> {
        API.get_or_init(|| unsafe { Self::load_library(dir) })
            .as_ref()
            .map_err(|message| Error::Extraction(message.clone()))
    }

    unsafe fn load_library(dir: &Path) -> std::result::Result<Api, String> {
        let path = dir.join("winpty.dll");
        let module = LoadLibraryW(&HSTRING::from(path.as_os_str()))
            .map_err(|e| format!("cannot load {}: {}", path.display(), e))?;
        debug!(path = %path.display(), "loaded winpty");

        Ok(Api {
            error_msg: symbol!(module, "winpty_error_msg"),
            error_free: symbol!(module, "winpty_error_free"),
            config_new: symbol!(module, "winpty_config_new"),
            config_free: symbol!(module, "winpty_config_free"),
            config_set_initial_size: symbol!(module, "winpty_config_set_initial_size"),
            open: symbol!(module, "winpty_open"),
            conin_name: symbol!(module, "winpty_conin_name"),
            conout_name: symbol!(module, "winpty_conout_name"),
            spawn_config_new: symbol!(module, "winpty_spawn_config_new"),
            spawn_config_free: symbol!(module, "winpty_spawn_config_free"),
            spawn: symbol!(module, "winpty_spawn"),
            set_size: symbol!(module, "winpty_set_size"),
            free: symbol!(module, "winpty_free"),
        })
    }

    /// Message carried by a winpty error object, which is freed.
    pub fn take_error(&self, err: ErrorPtr) -> String {
        if err.is_null() {
            return "unknown winpty error".to_string();
        }
        // SAFETY: err came from a winpty call and is freed exactly once here
        unsafe {
            let message = wide_to_string((self.error_msg)(err));
            (self.error_free)(err);
            message
        }
    }
}

/// Copy a NUL-terminated UTF-16 string owned by winpty
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated UTF-16 buffer.
pub unsafe fn wide_to_string(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    String::from_utf16_lossy(PCWSTR(ptr).as_wide())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_to_string() {
        let text: Vec<u16> = "agent failed\0".encode_utf16().collect();
        assert_eq!(unsafe { wide_to_string(text.as_ptr()) }, "agent failed");
        assert_eq!(unsafe { wide_to_string(std::ptr::null()) }, "");
    }
}
