//! Native helper binaries bundled into the program image and written to a
//! temporary directory the first time a broker session needs them.
//!
//! Extraction happens at most once per process. The outcome, success or
//! failure, is cached: concurrent sessions share the extracted copy and a
//! failed extraction is not retried. The directory is left behind for the
//! OS temp cleanup; removal on exit is not guaranteed.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// One file to materialize
pub struct EmbeddedFile {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// A set of files extracted together into one directory
pub struct EmbeddedDeps {
    prefix: &'static str,
    files: &'static [EmbeddedFile],
    extracted: OnceLock<std::result::Result<PathBuf, String>>,
}

impl EmbeddedDeps {
    pub const fn new(prefix: &'static str, files: &'static [EmbeddedFile]) -> Self {
        Self {
            prefix,
            files,
            extracted: OnceLock::new(),
        }
    }

    /// Directory holding the extracted files, extracting them on first use.
    pub fn ensure_extracted(&self) -> Result<&Path> {
        match self.extracted.get_or_init(|| self.extract()) {
            Ok(dir) => Ok(dir.as_path()),
            Err(message) => Err(Error::Extraction(message.clone())),
        }
    }

    fn target_dir(&self) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}-{}",
            self.prefix,
            env!("CARGO_PKG_VERSION"),
            std::process::id()
        ))
    }

    fn extract(&self) -> std::result::Result<PathBuf, String> {
        let dir = self.target_dir();
        fs::create_dir_all(&dir)
            .map_err(|e| format!("cannot create {}: {}", dir.display(), e))?;

        for file in self.files {
            if file.bytes.is_empty() {
                return Err(format!("{} was not bundled at build time", file.name));
            }
            let path = dir.join(file.name);
            fs::write(&path, file.bytes)
                .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
        }

        debug!(dir = %dir.display(), files = self.files.len(), "extracted embedded dependencies");
        Ok(dir)
    }
}

#[cfg(windows)]
static WINPTY: EmbeddedDeps = EmbeddedDeps::new(
    "vterm-winpty",
    &[
        EmbeddedFile {
            name: "winpty-agent.exe",
            bytes: include_bytes!(concat!(env!("OUT_DIR"), "/winpty-agent.exe")),
        },
        EmbeddedFile {
            name: "winpty.dll",
            bytes: include_bytes!(concat!(env!("OUT_DIR"), "/winpty.dll")),
        },
    ],
);

/// Directory containing `winpty-agent.exe` and `winpty.dll`
#[cfg(windows)]
pub fn ensure_extracted() -> Result<&'static Path> {
    WINPTY.ensure_extracted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    static FILES: [EmbeddedFile; 2] = [
        EmbeddedFile {
            name: "agent.bin",
            bytes: b"agent",
        },
        EmbeddedFile {
            name: "runtime.bin",
            bytes: b"runtime",
        },
    ];

    #[test]
    fn test_extracts_once_for_concurrent_callers() {
        static DEPS: EmbeddedDeps = EmbeddedDeps::new("vterm-embed-test", &FILES);

        let dirs: Vec<PathBuf> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| DEPS.ensure_extracted().unwrap().to_path_buf()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(dirs.windows(2).all(|pair| pair[0] == pair[1]));

        let dir = &dirs[0];
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["agent.bin", "runtime.bin"]);
        assert_eq!(fs::read(dir.join("runtime.bin")).unwrap(), b"runtime");

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_missing_blob_fails_and_is_not_retried() {
        static EMPTY: [EmbeddedFile; 1] = [EmbeddedFile {
            name: "agent.bin",
            bytes: b"",
        }];
        static DEPS: EmbeddedDeps = EmbeddedDeps::new("vterm-embed-empty-test", &EMPTY);

        assert!(matches!(DEPS.ensure_extracted(), Err(Error::Extraction(_))));
        assert!(matches!(DEPS.ensure_extracted(), Err(Error::Extraction(_))));

        let _ = fs::remove_dir_all(DEPS.target_dir());
    }
}
