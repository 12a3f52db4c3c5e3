//! C interface shared between the plugin loader and plugin libraries.
//!
//! These layouts are an ABI contract with plugins built against interface
//! version [`MBX_PLUGIN_INTERFACE_VERSION`]; change them only together with a
//! version bump.

use std::ffi::{c_char, c_int, c_uint, c_void};

use bitflags::bitflags;

/// Bumped whenever the interface changes so that old plugins can't be loaded.
pub const MBX_PLUGIN_INTERFACE_VERSION: c_uint = 10;

bitflags! {
    /// CPU feature flags detected by the loader.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuFeatures: u32 {
        const AMD_3DNOW = 1 << 0;
        const SSE = 1 << 1;
    }
}

/// Runs immediately before main.cs.
pub type GameStartFn = extern "C" fn();

/// Runs whenever `clientProcess(U32)` is called, before anything else in the
/// engine is updated.
pub type ClientProcessFn = extern "C" fn(delta_ms: u32);

/// Runs after the GL context has been created and made current.
pub type GlContextReadyFn = extern "C" fn();

/// Runs before the GL context is deactivated and destroyed.
pub type GlContextDestroyFn = extern "C" fn();

/// Runs after the `onExit()` script callback.
pub type GameExitFn = extern "C" fn();

/// Runs when the plugin is unloaded, after the engine has shut down.
pub type UnloadFn = extern "C" fn();

/// Context handed to each plugin's `PluginMain`.
#[repr(C)]
pub struct RawPlugin {
    pub version: c_uint,
    pub min_version: c_uint,
    pub name: *const c_char,
    pub path: *const c_char,
    /// Pipeline number for release builds, 0 for local builds.
    pub build_pipeline: c_int,
    /// Commit hash for release builds, empty for local builds.
    pub build_hash: *const c_char,
    /// Start of the game executable's `.text` segment.
    pub text_start: *mut c_void,
    pub text_size: usize,
    pub cpu_features: CpuFeatures,
    pub seed: u32,
    pub op: *const PluginOperations,
}

/// Loader function table.
#[repr(C)]
pub struct PluginOperations {
    /// Returns a pointer that reaches the original function, or null.
    pub intercept: unsafe extern "C" fn(
        plugin: *const RawPlugin,
        func: *mut c_void,
        new_func: *mut c_void,
    ) -> *mut c_void,
    pub on_game_start: unsafe extern "C" fn(plugin: *const RawPlugin, cb: GameStartFn),
    pub on_client_process: unsafe extern "C" fn(plugin: *const RawPlugin, cb: ClientProcessFn),
    pub on_gl_context_ready: unsafe extern "C" fn(plugin: *const RawPlugin, cb: GlContextReadyFn),
    pub on_gl_context_destroy:
        unsafe extern "C" fn(plugin: *const RawPlugin, cb: GlContextDestroyFn),
    pub on_game_exit: unsafe extern "C" fn(plugin: *const RawPlugin, cb: GameExitFn),
    pub on_unload: unsafe extern "C" fn(plugin: *const RawPlugin, cb: UnloadFn),
    /// Message shown if `PluginMain` fails. Null clears it.
    pub set_error: unsafe extern "C" fn(plugin: *const RawPlugin, message: *const c_char),
}

/// `PluginMain` result. Plugins are not necessarily written in Rust, so any
/// value may come back; anything unknown counts as [`Status::ERROR`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub c_int);

impl Status {
    pub const OK: Status = Status(0);
    pub const ERROR: Status = Status(1);
    pub const ERROR_VERSION: Status = Status(2);
}

/// Signature of the `PluginMain` export.
pub type PluginMainFn = unsafe extern "C" fn(plugin: *const RawPlugin) -> Status;
