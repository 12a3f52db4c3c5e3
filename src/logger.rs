//! Log output for the loader and for plugins.
//!
//! Every library built on this crate carries its own copy of the `tracing`
//! globals, so the loader and each plugin set up their own subscriber.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;

use crate::config::Settings;
use crate::plugin::Plugin;

/// Sends the loader's logs to the configured file.
pub fn init_loader(settings: &Settings) -> color_eyre::Result<()> {
    let file = File::create(&settings.log_file)?;
    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_max_level(settings.log_level)
        .try_init()
        .map_err(|e| color_eyre::Report::msg(e.to_string()))
}

/// Sends a plugin's logs to `<plugin path>.log`. Does nothing if a subscriber
/// is already set or the file can't be created.
pub fn init_plugin(plugin: &Plugin) {
    let Ok(file) = File::create(plugin_log_path(plugin.path())) else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_max_level(plugin_log_level(plugin.build_pipeline()))
        .try_init();
}

pub fn plugin_log_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".log");
    PathBuf::from(name)
}

/// Local loader builds and debug plugin builds log everything.
pub fn plugin_log_level(build_pipeline: i32) -> Level {
    if cfg!(debug_assertions) || build_pipeline == 0 {
        Level::TRACE
    } else {
        Level::INFO
    }
}
