use std::env;
use std::path::{Path, PathBuf};

use color_eyre::eyre::eyre;
use libloading::Library;
use mbextender::config::Settings;
use mbextender::ffi::PluginMainFn;
use mbextender::loader::{discover, plugin_name, PLUGIN_MAIN};
use mbextender::Error;
use tracing::{info, warn};

/// Lists the plugins the loader would pick up from a directory and checks
/// that each one opens and exports `PluginMain`.
fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt().init();

    let dir = env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| Settings::get().plugin_dir.clone());
    info!("Scanning {}", dir.display());

    let paths = discover(&dir)?;
    let mut problems = 0;
    for path in &paths {
        match check_library(path) {
            Ok(()) => info!("{}: ok ({})", plugin_name(path), path.display()),
            Err(e) => {
                problems += 1;
                warn!("{}", e);
            }
        }
    }
    info!("Found {} plugin(s)", paths.len());

    if problems > 0 {
        return Err(eyre!("{} plugin(s) would fail to load", problems));
    }
    Ok(())
}

// Opening a library runs its static constructors but never PluginMain
fn check_library(path: &Path) -> mbextender::Result<()> {
    let library = unsafe { Library::new(path) }.map_err(|source| Error::InvalidLibrary {
        path: path.to_path_buf(),
        source,
    })?;
    unsafe { library.get::<PluginMainFn>(PLUGIN_MAIN) }
        .map_err(|_| Error::MissingEntryPoint(plugin_name(path)))?;
    Ok(())
}
