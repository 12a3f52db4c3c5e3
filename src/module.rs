//! Deferred plugin initialization.
//!
//! An [`Installer`] describes one action to perform when the plugin is
//! initialized: registering a console function, overriding a host function,
//! and so on. Installers are usually declared with the registration macros
//! (`console_function!`, `fn_override!`), which add them to a [`Module`] from
//! a library constructor, long before `PluginMain` runs. The plugin then
//! applies each module once with `mbx_install!`.
//!
//! ```ignore
//! mbx_module!(DDS_LOADER);
//!
//! console_function!(DDS_LOADER, "reloadDds", ConsoleCallback::Void(reload_dds), "reloadDds()", 1, 1);
//!
//! fn init(plugin: &mut Plugin) -> mbextender::Result<()> {
//!     mbx_install!(plugin, DDS_LOADER)
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info_span, warn};

use crate::plugin::Plugin;
use crate::{Error, Result};

/// A deferred registration action.
pub trait Installer: Sync {
    /// Performs the action. Called exactly once, from [`Module::install`].
    fn install(&self, plugin: &mut Plugin) -> Result<()>;
}

/// A named group of installers, applied in the order they were added.
pub struct Module {
    name: &'static str,
    installers: Mutex<Vec<&'static dyn Installer>>,
    installed: AtomicBool,
}

impl Module {
    pub const fn new(name: &'static str) -> Self {
        Module {
            name,
            installers: Mutex::new(Vec::new()),
            installed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends an installer to the module.
    pub fn add(&self, installer: &'static dyn Installer) {
        self.installers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(installer);
    }

    pub fn len(&self) -> usize {
        self.installers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Runs every installer in insertion order, stopping at the first
    /// failure. Whatever the earlier installers did stays in effect.
    ///
    /// A module can only be installed once.
    pub fn install(&self, plugin: &mut Plugin) -> Result<()> {
        if self.installed.swap(true, Ordering::AcqRel) {
            warn!("Module {} is already installed", self.name);
            return Err(Error::AlreadyInstalled(self.name));
        }

        let _span = info_span!("module", name = self.name).entered();

        // Installers may add to other modules, so don't hold the lock
        let installers = self
            .installers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!("Installing {} installers", installers.len());
        for installer in installers {
            installer.install(plugin)?;
        }
        Ok(())
    }
}

/// Declares a static [`Module`].
#[macro_export]
macro_rules! mbx_module {
    ($vis:vis $name:ident) => {
        $vis static $name: $crate::module::Module = $crate::module::Module::new(stringify!($name));
    };
}

/// Installs one or more modules declared with [`mbx_module!`]. Call this from
/// the plugin's init function. Evaluates to `mbextender::Result<()>`.
#[macro_export]
macro_rules! mbx_install {
    ($plugin:expr, $($module:path),+ $(,)?) => {{
        let plugin: &mut $crate::plugin::Plugin = $plugin;
        let mut result: $crate::Result<()> = Ok(());
        $(
            if result.is_ok() {
                result = $module.install(&mut *plugin);
            }
        )+
        result
    }};
}
