//! Host side: loads plugin libraries into the game and drives their
//! lifecycle callbacks.

mod cpu;
mod discover;
mod plugin_host;

use std::path::Path;

use libloading::Library;
use tracing::{debug, error, info, instrument, warn};

pub use cpu::detect_cpu_features;
pub use discover::{discover, plugin_name};
pub use plugin_host::PluginHost;

use crate::ffi::{CpuFeatures, PluginMainFn, Status};
use crate::host::HostAbi;
use crate::intercept::{CodeAllocator, PageAllocator};
use crate::{Error, Result};

/// Name of the entry point every plugin exports.
pub const PLUGIN_MAIN: &[u8] = b"PluginMain\0";

/// Creates the trampoline allocator for each new plugin.
pub type AllocatorFactory = Box<dyn FnMut() -> Box<dyn CodeAllocator + Send> + Send>;

/// What the loader tells plugins about the process.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub text_start: *mut u8,
    pub text_size: usize,
    /// Instruction set of the patched code: 32 for the game.
    pub bitness: u32,
    pub cpu_features: CpuFeatures,
    pub build_pipeline: i32,
    pub build_hash: String,
}

unsafe impl Send for LoaderOptions {}

impl LoaderOptions {
    /// Options for the running game build.
    pub fn for_host(abi: &HostAbi) -> Self {
        LoaderOptions {
            text_start: abi.text_start(),
            text_size: abi.text_size,
            bitness: 32,
            cpu_features: detect_cpu_features(),
            build_pipeline: option_env!("MBEXTENDER_CI_PIPELINE_ID")
                .and_then(|id| id.parse().ok())
                .unwrap_or(0),
            build_hash: option_env!("MBEXTENDER_CI_COMMIT_SHA")
                .unwrap_or_default()
                .to_string(),
        }
    }
}

struct LoadedPlugin {
    // Dropped first: restoring intercepts needs the library's code mapped
    host: Box<PluginHost>,
    library: Option<Library>,
    /// `PluginMain` failed. Whatever the plugin patched stays in place until
    /// unload, so its code stays mapped, but it gets no callbacks.
    failed: bool,
}

/// Loads plugins and fans engine events out to them in load order.
///
/// Dropping the loader unloads whatever is still loaded.
pub struct PluginLoader {
    options: LoaderOptions,
    allocators: AllocatorFactory,
    /// Every plugin whose `PluginMain` ran, in load order.
    plugins: Vec<LoadedPlugin>,
}

impl PluginLoader {
    pub fn new(options: LoaderOptions, allocators: AllocatorFactory) -> Self {
        PluginLoader {
            options,
            allocators,
            plugins: Vec::new(),
        }
    }

    /// Loader for the running game, with trampolines in fresh pages.
    pub fn for_host(abi: &HostAbi) -> Self {
        Self::new(
            LoaderOptions::for_host(abi),
            Box::new(|| Box::new(PageAllocator::new())),
        )
    }

    /// Loads every plugin in `dir`. One plugin failing doesn't stop the
    /// others; all failures are reported together at the end.
    #[instrument(skip(self))]
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        info!("Using plugin interface version {}", crate::ffi::MBX_PLUGIN_INTERFACE_VERSION);
        let mut errors = Vec::new();
        for path in discover(dir)? {
            if let Err(e) = self.load_library(&path) {
                error!("{}", e);
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::PluginsFailed(errors))
        }
    }

    /// Opens one plugin library and runs its `PluginMain`.
    pub fn load_library(&mut self, path: &Path) -> Result<()> {
        info!("Loading {}", path.display());
        let name = plugin_name(path);
        let library = unsafe { Library::new(path) }.map_err(|source| Error::InvalidLibrary {
            path: path.to_path_buf(),
            source,
        })?;
        let main = match unsafe { library.get::<PluginMainFn>(PLUGIN_MAIN) } {
            Ok(symbol) => *symbol,
            Err(e) => {
                debug!("{}: {}", name, e);
                return Err(Error::MissingEntryPoint(name));
            }
        };
        self.load_entry(&name, path, main, Some(library))
    }

    /// Runs a plugin entry point. `library` is kept alive for as long as the
    /// plugin is.
    pub fn load_entry(
        &mut self,
        name: &str,
        path: &Path,
        main: PluginMainFn,
        library: Option<Library>,
    ) -> Result<()> {
        let host = PluginHost::new(name, path, &self.options, (self.allocators)());
        let status = unsafe { main(host.raw()) };

        let reason = match status {
            Status::OK => {
                debug!("{} loaded with {} intercepts", name, host.intercept_count());
                self.plugins.push(LoadedPlugin {
                    host,
                    library,
                    failed: false,
                });
                return Ok(());
            }
            Status::ERROR_VERSION => "Unsupported interface version".to_string(),
            status => {
                if status != Status::ERROR {
                    debug!("{} returned unknown status {}", name, status.0);
                }
                host.error()
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string())
            }
        };
        if host.intercept_count() > 0 {
            warn!("{} failed after installing intercepts; they stay active", name);
        }
        self.plugins.push(LoadedPlugin {
            host,
            library,
            failed: true,
        });
        Err(Error::PluginFailed {
            name: name.to_string(),
            reason,
        })
    }

    fn loaded(&self) -> impl Iterator<Item = &PluginHost> {
        self.plugins
            .iter()
            .filter(|p| !p.failed)
            .map(|p| p.host.as_ref())
    }

    /// Names of the loaded plugins, in load order.
    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.loaded().map(PluginHost::name)
    }

    pub fn len(&self) -> usize {
        self.loaded().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed_len(&self) -> usize {
        self.plugins.iter().filter(|p| p.failed).count()
    }

    /// Runs before main.cs.
    pub fn fire_game_start(&self) {
        self.loaded().for_each(PluginHost::fire_game_start);
    }

    pub fn fire_client_process(&self, delta_ms: u32) {
        self.loaded().for_each(|host| host.fire_client_process(delta_ms));
    }

    pub fn fire_gl_context_ready(&self) {
        self.loaded().for_each(PluginHost::fire_gl_context_ready);
    }

    pub fn fire_gl_context_destroy(&self) {
        self.loaded().for_each(PluginHost::fire_gl_context_destroy);
    }

    pub fn fire_game_exit(&self) {
        self.loaded().for_each(PluginHost::fire_game_exit);
    }

    /// Unloads plugins newest first, so intercepts are undone in the reverse
    /// order they were made. Failed plugins get no unload callback but their
    /// intercepts are restored in turn.
    #[instrument(skip(self))]
    pub fn unload_all(&mut self) {
        if self.plugins.is_empty() {
            return;
        }
        while let Some(LoadedPlugin {
            host,
            library,
            failed,
        }) = self.plugins.pop()
        {
            info!("Unloading {}", host.name());
            if !failed {
                host.fire_unload();
            }
            host.restore_intercepts();
            drop(host);
            drop(library);
        }
        info!("All plugins unloaded");
    }
}

impl Drop for PluginLoader {
    fn drop(&mut self) {
        self.unload_all();
    }
}
