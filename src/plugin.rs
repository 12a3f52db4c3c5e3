//! Plugin side of the loader interface.
//!
//! A plugin library exports `PluginMain` (see [`crate::plugin_main!`]); the
//! loader calls it once with a [`RawPlugin`] context, which is wrapped here
//! in a [`Plugin`].

use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info};

use crate::console::{CommandRegistry, EngineConsole, NullConsole};
use crate::ffi::{
    ClientProcessFn, CpuFeatures, GameExitFn, GameStartFn, GlContextDestroyFn, GlContextReadyFn,
    PluginOperations, RawPlugin, Status, UnloadFn, MBX_PLUGIN_INTERFACE_VERSION,
};
use crate::interop::{erase, from_ptr, HostFn};
use crate::{logger, CodeStream, Error, Result};

/// One loaded plugin's view of the host process.
pub struct Plugin {
    raw: *const RawPlugin,
    name: String,
    path: PathBuf,
    build_pipeline: i32,
    build_hash: String,
    code_stream: CodeStream,
    console: Box<dyn CommandRegistry>,
}

unsafe impl Send for Plugin {}

impl Plugin {
    /// Wraps the context passed to `PluginMain`.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid context of the current interface version that
    /// outlives the returned value.
    pub unsafe fn new(raw: *const RawPlugin) -> Self {
        let context = &*raw;
        Plugin {
            raw,
            name: owned_string(context.name),
            path: PathBuf::from(owned_string(context.path)),
            build_pipeline: context.build_pipeline,
            build_hash: owned_string(context.build_hash),
            code_stream: CodeStream::new(context.text_start.cast(), context.text_size),
            console: default_console(),
        }
    }

    /// Checks that the loader's context is compatible with this library.
    ///
    /// Only the two version fields are read, so this is safe to call on a
    /// context of any version.
    ///
    /// # Safety
    ///
    /// `raw` must point to at least the two leading version fields.
    pub unsafe fn check_version(raw: *const RawPlugin) -> Result<()> {
        let (version, min_version) = ((*raw).version, (*raw).min_version);
        if (min_version..=version).contains(&MBX_PLUGIN_INTERFACE_VERSION) {
            Ok(())
        } else {
            Err(Error::VersionMismatch {
                version,
                min_version,
            })
        }
    }

    pub fn raw(&self) -> *const RawPlugin {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the plugin library.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pipeline number of the loader build, 0 for local builds.
    pub fn build_pipeline(&self) -> i32 {
        self.build_pipeline
    }

    pub fn build_hash(&self) -> &str {
        &self.build_hash
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        unsafe { (*self.raw).cpu_features }
    }

    /// Random seed picked by the loader for this plugin.
    pub fn seed(&self) -> u32 {
        unsafe { (*self.raw).seed }
    }

    /// Stream over the game's code segment, for patching call sites that
    /// interception can't reach.
    pub fn code_stream(&mut self) -> &mut CodeStream {
        &mut self.code_stream
    }

    /// Where console installers register their commands.
    pub fn console(&self) -> &dyn CommandRegistry {
        self.console.as_ref()
    }

    pub fn set_console(&mut self, console: Box<dyn CommandRegistry>) {
        self.console = console;
    }

    fn ops(&self) -> &PluginOperations {
        unsafe { &*(*self.raw).op }
    }

    /// Redirects `func` to `replacement` and returns a pointer that still
    /// reaches the previous behavior of `func`.
    pub fn intercept<T: Copy>(&self, func: HostFn<T>, replacement: T) -> Result<T> {
        let trampoline = self.intercept_raw(func.as_ptr(), erase(replacement))?;
        Ok(unsafe { from_ptr(trampoline) })
    }

    /// Untyped [`Plugin::intercept`].
    pub fn intercept_raw(&self, func: *mut c_void, replacement: *mut c_void) -> Result<*mut c_void> {
        let trampoline = unsafe { (self.ops().intercept)(self.raw, func, replacement) };
        if trampoline.is_null() {
            Err(Error::InterceptFailed(func as usize))
        } else {
            Ok(trampoline)
        }
    }

    /// Message the loader shows if `PluginMain` fails.
    pub fn set_error(&self, message: &str) {
        let message = CString::new(message.replace('\0', "")).unwrap_or_default();
        unsafe { (self.ops().set_error)(self.raw, message.as_ptr()) }
    }

    pub fn clear_error(&self) {
        unsafe { (self.ops().set_error)(self.raw, std::ptr::null()) }
    }

    /// Fired when the engine has finished initializing, right before main.cs.
    pub fn on_game_start(&self, cb: GameStartFn) {
        unsafe { (self.ops().on_game_start)(self.raw, cb) }
    }

    /// Fired on every `clientProcess(U32)`, before anything else updates.
    pub fn on_client_process(&self, cb: ClientProcessFn) {
        unsafe { (self.ops().on_client_process)(self.raw, cb) }
    }

    pub fn on_gl_context_ready(&self, cb: GlContextReadyFn) {
        unsafe { (self.ops().on_gl_context_ready)(self.raw, cb) }
    }

    pub fn on_gl_context_destroy(&self, cb: GlContextDestroyFn) {
        unsafe { (self.ops().on_gl_context_destroy)(self.raw, cb) }
    }

    /// Fired right after the script `onExit()` callback.
    pub fn on_game_exit(&self, cb: GameExitFn) {
        unsafe { (self.ops().on_game_exit)(self.raw, cb) }
    }

    /// Fired at unload. The engine has already shut down.
    pub fn on_unload(&self, cb: UnloadFn) {
        unsafe { (self.ops().on_unload)(self.raw, cb) }
    }
}

unsafe fn owned_string(s: *const std::ffi::c_char) -> String {
    if s.is_null() {
        String::new()
    } else {
        CStr::from_ptr(s).to_string_lossy().into_owned()
    }
}

fn default_console() -> Box<dyn CommandRegistry> {
    match EngineConsole::current() {
        Some(console) => Box::new(console),
        None => Box::new(NullConsole),
    }
}

static ACTIVE: Mutex<Option<Plugin>> = Mutex::new(None);

extern "C" fn release_plugin() {
    let mut active = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    active.take();
}

/// Runs `f` with this library's plugin context, if `PluginMain` succeeded and
/// the plugin hasn't been unloaded.
pub fn with_plugin<R>(f: impl FnOnce(&mut Plugin) -> R) -> Option<R> {
    let mut active = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    active.as_mut().map(f)
}

/// Body of an exported `PluginMain`.
///
/// The version is checked before anything else. On success the context is
/// kept until the plugin is unloaded; on failure the error is handed to the
/// loader through `setError`.
///
/// # Safety
///
/// `raw` must be null or the context the loader passed to `PluginMain`.
pub unsafe fn run_plugin_main<F>(raw: *const RawPlugin, init: F) -> Status
where
    F: FnOnce(&mut Plugin) -> Result<()>,
{
    if raw.is_null() {
        return Status::ERROR;
    }
    if Plugin::check_version(raw).is_err() {
        return Status::ERROR_VERSION;
    }

    let mut plugin = Plugin::new(raw);
    logger::init_plugin(&plugin);
    info!("Initializing {}", plugin.name());
    match init(&mut plugin) {
        Ok(()) => {
            plugin.on_unload(release_plugin);
            let mut active = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
            *active = Some(plugin);
            Status::OK
        }
        Err(e) => {
            error!("{} failed to initialize: {}", plugin.name(), e);
            plugin.set_error(&e.to_string());
            Status::ERROR
        }
    }
}

/// Exports `PluginMain`, running `$init` with the plugin context.
///
/// ```ignore
/// fn init(plugin: &mut Plugin) -> mbextender::Result<()> {
///     mbx_install!(plugin, PHYSICS)
/// }
///
/// plugin_main!(init);
/// ```
#[macro_export]
macro_rules! plugin_main {
    ($init:path) => {
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "C" fn PluginMain(
            plugin: *const $crate::ffi::RawPlugin,
        ) -> $crate::ffi::Status {
            $crate::plugin::run_plugin_main(plugin, $init)
        }
    };
}
