//! Stage the winpty runtime into `OUT_DIR` so the broker backend can embed
//! it with `include_bytes!`.
//!
//! The binaries are looked up in `VTERM_WINPTY_DIR`, then in a `winpty`
//! directory next to the manifest. When they are missing, empty files are
//! staged so the crate still builds; sessions then fail at start with an
//! extraction error.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const WINPTY_ARTIFACTS: [&str; 2] = ["winpty-agent.exe", "winpty.dll"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=VTERM_WINPTY_DIR");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "windows" {
        return;
    }

    if let Err(err) = stage_winpty_artifacts() {
        println!("cargo:warning=winpty runtime files not prepared: {err}");
    }
}

fn stage_winpty_artifacts() -> Result<(), String> {
    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| "OUT_DIR is not set".to_string())?;

    let source_dir = locate_winpty_artifacts();
    let mut missing = Vec::new();

    for artifact in WINPTY_ARTIFACTS {
        let destination = out_dir.join(artifact);
        match source_dir.as_deref().map(|dir| dir.join(artifact)) {
            Some(source) if source.is_file() => {
                println!("cargo:rerun-if-changed={}", source.display());
                fs::copy(&source, &destination).map_err(|e| {
                    format!(
                        "failed to copy {} from {} to {}: {}",
                        artifact,
                        source.display(),
                        destination.display(),
                        e
                    )
                })?;
            }
            _ => {
                fs::write(&destination, b"")
                    .map_err(|e| format!("failed to stage {}: {}", destination.display(), e))?;
                missing.push(artifact);
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "{} not found; set VTERM_WINPTY_DIR to the directory holding them",
            missing.join(", ")
        ))
    }
}

fn locate_winpty_artifacts() -> Option<PathBuf> {
    let candidates = env::var_os("VTERM_WINPTY_DIR").map(PathBuf::from).into_iter().chain(
        env::var_os("CARGO_MANIFEST_DIR").map(|dir| Path::new(&dir).join("winpty")),
    );

    candidates
        .into_iter()
        .find(|dir| WINPTY_ARTIFACTS.iter().any(|name| dir.join(name).is_file()))
}
