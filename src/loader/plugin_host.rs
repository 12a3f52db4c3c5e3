use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

use tracing::{debug, trace, warn};

use super::LoaderOptions;
use crate::ffi::{
    ClientProcessFn, GameExitFn, GameStartFn, GlContextDestroyFn, GlContextReadyFn,
    PluginOperations, RawPlugin, UnloadFn, MBX_PLUGIN_INTERFACE_VERSION,
};
use crate::intercept::{CodeAllocator, FuncInterceptor};
use crate::CodeStream;

static OPERATIONS: PluginOperations = PluginOperations {
    intercept: op_intercept,
    on_game_start: op_on_game_start,
    on_client_process: op_on_client_process,
    on_gl_context_ready: op_on_gl_context_ready,
    on_gl_context_destroy: op_on_gl_context_destroy,
    on_game_exit: op_on_game_exit,
    on_unload: op_on_unload,
    set_error: op_set_error,
};

#[derive(Default)]
struct Callbacks {
    game_start: Vec<GameStartFn>,
    client_process: Vec<ClientProcessFn>,
    gl_context_ready: Vec<GlContextReadyFn>,
    gl_context_destroy: Vec<GlContextDestroyFn>,
    game_exit: Vec<GameExitFn>,
    unload: Vec<UnloadFn>,
}

struct HostState {
    interceptor: FuncInterceptor,
    callbacks: Callbacks,
    error: Option<String>,
}

/// The loader's side of one plugin: the context handed to `PluginMain` and
/// everything the plugin registers through it.
///
/// Dropping the host undoes the plugin's intercepts.
#[repr(C)]
pub struct PluginHost {
    // Must stay first: operations get a pointer to it and cast back
    raw: RawPlugin,
    name: CString,
    path: CString,
    build_hash: CString,
    state: RefCell<HostState>,
}

unsafe impl Send for PluginHost {}

impl PluginHost {
    pub fn new(
        name: &str,
        path: &Path,
        options: &LoaderOptions,
        allocator: Box<dyn CodeAllocator + Send>,
    ) -> Box<Self> {
        let name = c_string(name);
        let path = c_string(&path.to_string_lossy());
        let build_hash = c_string(&options.build_hash);
        let stream = unsafe { CodeStream::new(options.text_start, options.text_size) };

        let mut host = Box::new(PluginHost {
            raw: RawPlugin {
                version: MBX_PLUGIN_INTERFACE_VERSION,
                min_version: MBX_PLUGIN_INTERFACE_VERSION,
                name: ptr::null(),
                path: ptr::null(),
                build_pipeline: options.build_pipeline,
                build_hash: ptr::null(),
                text_start: options.text_start.cast(),
                text_size: options.text_size,
                cpu_features: options.cpu_features,
                seed: rand::random(),
                op: &OPERATIONS,
            },
            name,
            path,
            build_hash,
            state: RefCell::new(HostState {
                interceptor: FuncInterceptor::new(stream, allocator, options.bitness),
                callbacks: Callbacks::default(),
                error: None,
            }),
        });
        // CString buffers don't move with the box
        host.raw.name = host.name.as_ptr();
        host.raw.path = host.path.as_ptr();
        host.raw.build_hash = host.build_hash.as_ptr();
        host
    }

    /// Recovers the host from the pointer given to the plugin.
    unsafe fn from_raw<'a>(raw: *const RawPlugin) -> Option<&'a PluginHost> {
        (raw as *const PluginHost).as_ref()
    }

    /// Pointer to pass to `PluginMain`.
    pub fn raw(&self) -> *const RawPlugin {
        &self.raw
    }

    #[cfg(test)]
    pub(crate) fn raw_mut(&mut self) -> &mut RawPlugin {
        &mut self.raw
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn seed(&self) -> u32 {
        self.raw.seed
    }

    /// Message set by the plugin through `setError`.
    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn intercept_count(&self) -> usize {
        self.state.borrow().interceptor.len()
    }

    fn intercept(&self, func: *mut c_void, new_func: *mut c_void) -> *mut c_void {
        let result = self
            .state
            .borrow_mut()
            .interceptor
            .intercept(func.cast(), new_func.cast());
        match result {
            Some(previous) => previous.cast(),
            None => {
                warn!("{}: failed to intercept {:p}", self.name(), func);
                ptr::null_mut()
            }
        }
    }

    fn set_error(&self, message: Option<String>) {
        self.state.borrow_mut().error = message;
    }

    /// Snapshot of one callback list, so callbacks may register more.
    fn callbacks<T: Copy>(&self, list: impl FnOnce(&Callbacks) -> &Vec<T>) -> Vec<T> {
        list(&self.state.borrow().callbacks).clone()
    }

    pub fn fire_game_start(&self) {
        for cb in self.callbacks(|c| &c.game_start) {
            cb();
        }
    }

    pub fn fire_client_process(&self, delta_ms: u32) {
        for cb in self.callbacks(|c| &c.client_process) {
            cb(delta_ms);
        }
    }

    pub fn fire_gl_context_ready(&self) {
        for cb in self.callbacks(|c| &c.gl_context_ready) {
            cb();
        }
    }

    pub fn fire_gl_context_destroy(&self) {
        for cb in self.callbacks(|c| &c.gl_context_destroy) {
            cb();
        }
    }

    pub fn fire_game_exit(&self) {
        for cb in self.callbacks(|c| &c.game_exit) {
            cb();
        }
    }

    pub fn fire_unload(&self) {
        for cb in self.callbacks(|c| &c.unload) {
            cb();
        }
    }

    /// Undoes the plugin's intercepts.
    pub fn restore_intercepts(&self) {
        self.state.borrow_mut().interceptor.restore_all();
    }
}

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

unsafe extern "C" fn op_intercept(
    plugin: *const RawPlugin,
    func: *mut c_void,
    new_func: *mut c_void,
) -> *mut c_void {
    match PluginHost::from_raw(plugin) {
        Some(host) => host.intercept(func, new_func),
        None => ptr::null_mut(),
    }
}

macro_rules! callback_op {
    ($op:ident, $field:ident, $ty:ty) => {
        unsafe extern "C" fn $op(plugin: *const RawPlugin, cb: $ty) {
            if let Some(host) = PluginHost::from_raw(plugin) {
                trace!("{}: {} callback registered", host.name(), stringify!($field));
                host.state.borrow_mut().callbacks.$field.push(cb);
            }
        }
    };
}

callback_op!(op_on_game_start, game_start, GameStartFn);
callback_op!(op_on_client_process, client_process, ClientProcessFn);
callback_op!(op_on_gl_context_ready, gl_context_ready, GlContextReadyFn);
callback_op!(op_on_gl_context_destroy, gl_context_destroy, GlContextDestroyFn);
callback_op!(op_on_game_exit, game_exit, GameExitFn);
callback_op!(op_on_unload, unload, UnloadFn);

unsafe extern "C" fn op_set_error(plugin: *const RawPlugin, message: *const c_char) {
    let Some(host) = PluginHost::from_raw(plugin) else {
        return;
    };
    let message = (!message.is_null()).then(|| CStr::from_ptr(message).to_string_lossy().into_owned());
    debug!("{}: error set to {:?}", host.name(), message);
    host.set_error(message);
}
