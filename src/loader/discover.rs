use std::env::consts::DLL_EXTENSION;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::{Error, Result};

/// Finds the plugin libraries in `dir`, sorted by path.
///
/// A plugin is either a library file directly in `dir`, or a directory `X`
/// holding `X.<ext>` next to whatever else the plugin ships. Names starting
/// with `lib` are skipped: those are support libraries or leftovers.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::MissingDirectory(dir.to_path_buf()));
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_stem().and_then(OsStr::to_str) else {
            continue;
        };
        if name.starts_with("lib") {
            trace!("Skipping {}", path.display());
            continue;
        }

        if path.extension() == Some(OsStr::new(DLL_EXTENSION)) {
            if path.is_file() {
                paths.push(path);
            }
        } else if path.is_dir() {
            let library = path.join(format!("{}.{}", name, DLL_EXTENSION));
            if library.is_file() {
                paths.push(library);
            }
        }
    }
    paths.sort();
    Ok(paths)
}

/// Plugin name for a library path: the file name without extension.
pub fn plugin_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
