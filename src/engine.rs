//! Attaching the loader to the running game.
//!
//! The engine lifecycle functions are detoured so that plugins are loaded
//! once console namespaces exist and get their callbacks at the right
//! moments. Plugins may intercept the same functions afterwards: a detoured
//! entry starts with a jump, which plugin intercepts chain onto.

use std::ffi::{c_char, c_void, CString};
use std::sync::{Mutex, TryLockError};

use color_eyre::eyre::eyre;
use retour::static_detour;
use tracing::{error, info, warn};
use windows::core::PCSTR;
use windows::Win32::Foundation::HWND;
use windows::Win32::System::Threading::{GetCurrentProcess, TerminateProcess};
use windows::Win32::UI::WindowsAndMessaging::{MessageBoxA, MB_ICONERROR, MB_OK};

use crate::allocator::heap;
use crate::config::Settings;
use crate::host::{HostAbi, WINDOWS};
use crate::intercept::{FuncInterceptor, PageAllocator};
use crate::interop::from_ptr;
use crate::loader::PluginLoader;
use crate::{logger, CodeStream};

type EngineFn = extern "C" fn();
type ClientProcessFn = extern "C" fn(u32);
type GlActivateFn = extern "thiscall" fn(*mut c_void, u32, u32, u32, bool) -> bool;
type GlShutdownFn = extern "thiscall" fn(*mut c_void, bool);
type SetBoolVariableFn = unsafe extern "C" fn(*const c_char, bool);

static_detour! {
    static NamespaceInitHook: extern "C" fn();
    static ParticleEngineInitHook: extern "C" fn();
    static ParticleEngineDestroyHook: extern "C" fn();
    static ClientProcessHook: extern "C" fn(u32);
    static GlActivateHook: extern "thiscall" fn(*mut c_void, u32, u32, u32, bool) -> bool;
    static GlShutdownHook: extern "thiscall" fn(*mut c_void, bool);
    static ConShutdownHook: extern "C" fn();
    static NetShutdownHook: extern "C" fn();
}

static LOADER: Mutex<Option<PluginLoader>> = Mutex::new(None);

const UNSUPPORTED_GAME: &str =
    "MBExtender is only compatible with the full version of Marble Blast Gold.";

/// Verifies the game, makes its code writable and installs the lifecycle
/// hooks. Plugins are loaded later, from `Namespace::init()`.
pub fn attach() -> color_eyre::Result<()> {
    let settings = Settings::get();
    if let Err(e) = logger::init_loader(settings) {
        eprintln!("Logging disabled: {}", e);
    }

    let abi = &WINDOWS;
    if settings.verify_game && abi.verify().is_err() {
        show_error(UNSUPPORTED_GAME);
        terminate();
    }

    unsafe { abi.unprotect_text()? };
    install_heap_overrides(abi)?;
    *LOADER.lock().map_err(|_| eyre!("Plugin loader lock poisoned"))? =
        Some(PluginLoader::for_host(abi));
    unsafe { install_hooks(abi, settings)? };
    info!("MBExtender attached");
    Ok(())
}

/// Points the game's heap functions at the table plugins allocate from.
/// These intercepts are never restored.
fn install_heap_overrides(abi: &HostAbi) -> color_eyre::Result<()> {
    let Some(functions) = &abi.heap else {
        return Ok(());
    };
    let stream = unsafe { CodeStream::new(abi.text_start(), abi.text_size) };
    let interceptor: &'static mut FuncInterceptor =
        Box::leak(Box::new(FuncInterceptor::new(stream, Box::new(PageAllocator::new()), 32)));
    heap::install_overrides(functions, |func, new_func| interceptor.intercept(func, new_func))?;
    info!("Heap functions redirected to the shared allocator");
    Ok(())
}

/// Shows why attaching failed and leaves the game unhooked.
pub fn report_attach_failure(e: color_eyre::Report) {
    error!("Attach failed: {:?}", e);
    show_error(&format!("MBExtender failed to start:\n\n{}", e));
    detach();
}

/// Removes the lifecycle hooks.
pub fn detach() {
    unsafe {
        let _ = NetShutdownHook.disable();
        let _ = ConShutdownHook.disable();
        let _ = GlShutdownHook.disable();
        let _ = GlActivateHook.disable();
        let _ = ClientProcessHook.disable();
        let _ = ParticleEngineDestroyHook.disable();
        let _ = ParticleEngineInitHook.disable();
        let _ = NamespaceInitHook.disable();
    }
}

unsafe fn install_hooks(abi: &HostAbi, settings: &Settings) -> color_eyre::Result<()> {
    let target: EngineFn = from_ptr(abi.namespace_init.as_ptr());
    NamespaceInitHook.initialize(target, namespace_init_hooked)?;
    let target: EngineFn = from_ptr(abi.particle_engine_init.as_ptr());
    ParticleEngineInitHook.initialize(target, particle_engine_init_hooked)?;
    let target: EngineFn = from_ptr(abi.particle_engine_destroy.as_ptr());
    ParticleEngineDestroyHook.initialize(target, particle_engine_destroy_hooked)?;
    let target: GlActivateFn = from_ptr(abi.gl_device_activate.as_ptr());
    GlActivateHook.initialize(target, gl_device_activate_hooked)?;
    let target: GlShutdownFn = from_ptr(abi.gl_device_shutdown.as_ptr());
    GlShutdownHook.initialize(target, gl_device_shutdown_hooked)?;
    let target: EngineFn = from_ptr(abi.con_shutdown.as_ptr());
    ConShutdownHook.initialize(target, con_shutdown_hooked)?;
    let target: EngineFn = from_ptr(abi.net_shutdown.as_ptr());
    NetShutdownHook.initialize(target, net_shutdown_hooked)?;

    NamespaceInitHook.enable()?;
    ParticleEngineInitHook.enable()?;
    ParticleEngineDestroyHook.enable()?;
    GlActivateHook.enable()?;
    GlShutdownHook.enable()?;
    ConShutdownHook.enable()?;
    NetShutdownHook.enable()?;

    match settings.client_process {
        Some(address) => {
            let target: ClientProcessFn = from_ptr(address as *mut c_void);
            ClientProcessHook.initialize(target, client_process_hooked)?;
            ClientProcessHook.enable()?;
        }
        None => warn!("No clientProcess address configured; clientProcess callbacks are disabled"),
    }
    Ok(())
}

fn namespace_init_hooked() {
    unsafe { NamespaceInitHook.call() };
    load_plugins();
}

fn particle_engine_init_hooked() {
    unsafe { ParticleEngineInitHook.call() };
    with_loader(|loader| loader.fire_game_start());
}

fn particle_engine_destroy_hooked() {
    with_loader(|loader| loader.fire_game_exit());
    unsafe { ParticleEngineDestroyHook.call() };
}

fn client_process_hooked(delta_ms: u32) {
    with_loader(|loader| loader.fire_client_process(delta_ms));
    unsafe { ClientProcessHook.call(delta_ms) };
}

fn gl_device_activate_hooked(
    device: *mut c_void,
    width: u32,
    height: u32,
    bpp: u32,
    full_screen: bool,
) -> bool {
    let activated = unsafe { GlActivateHook.call(device, width, height, bpp, full_screen) };
    if activated {
        with_loader(|loader| loader.fire_gl_context_ready());
    }
    activated
}

fn gl_device_shutdown_hooked(device: *mut c_void, force: bool) {
    with_loader(|loader| loader.fire_gl_context_destroy());
    unsafe { GlShutdownHook.call(device, force) };
}

// The console stays up for logging: only the namespace teardown at the end of
// Con::shutdown() runs
fn con_shutdown_hooked() {
    unsafe {
        let namespace_shutdown = WINDOWS.namespace_shutdown.get();
        namespace_shutdown();
    }
}

fn net_shutdown_hooked() {
    unsafe { NetShutdownHook.call() };
    with_loader(|loader| loader.unload_all());
}

/// Runs `f` on the loader unless it's already busy further up the stack.
fn with_loader(f: impl FnOnce(&mut PluginLoader)) {
    let mut guard = match LOADER.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(e)) => e.into_inner(),
        Err(TryLockError::WouldBlock) => {
            warn!("Engine event raised from inside a plugin callback; skipped");
            return;
        }
    };
    if let Some(loader) = guard.as_mut() {
        f(loader);
    }
}

fn load_plugins() {
    info!("MBExtender Init:");
    let build_hash = option_env!("MBEXTENDER_CI_COMMIT_SHA").unwrap_or("unknown");
    info!(
        "Build {} ({})",
        option_env!("MBEXTENDER_CI_PIPELINE_ID").unwrap_or("0"),
        build_hash
    );

    let mut result = Ok(());
    with_loader(|loader| {
        result = loader.load_dir(&Settings::get().plugin_dir);
        if result.is_ok() {
            set_loaded_variables(loader);
        }
    });
    if let Err(e) = result {
        error!("Plugins failed to load:\n{}", e);
        show_error(&format!(
            "Unable to start the game because engine plugins failed to load:\n\n{}\n\n\
             Your antivirus software may be blocking engine plugins from loading. \
             Restore any game files that it blocked and create exceptions for them.",
            e
        ));
        std::process::exit(1);
    }
}

/// Sets `Plugin::Loaded<name>` for every loaded plugin so scripts can check.
fn set_loaded_variables(loader: &PluginLoader) {
    let set_bool_variable: SetBoolVariableFn = unsafe { from_ptr(WINDOWS.set_bool_variable.as_ptr()) };
    for name in loader.plugin_names() {
        match CString::new(format!("Plugin::Loaded{}", name)) {
            Ok(variable) => unsafe { set_bool_variable(variable.as_ptr(), true) },
            Err(_) => warn!("Plugin name {:?} can't be a variable name", name),
        }
    }
}

fn show_error(message: &str) {
    let text = CString::new(message.replace('\0', "")).unwrap_or_default();
    unsafe {
        MessageBoxA(
            HWND::default(),
            PCSTR(text.as_ptr().cast()),
            PCSTR(c"MBExtender Error".as_ptr().cast()),
            MB_OK | MB_ICONERROR,
        );
    }
}

fn terminate() -> ! {
    unsafe {
        let _ = TerminateProcess(GetCurrentProcess(), 0);
    }
    std::process::exit(0)
}
