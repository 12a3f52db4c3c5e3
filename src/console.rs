//! Script console bindings.
//!
//! A console command is a native callback with one of five return shapes,
//! registered under a name (and optionally a class namespace) with the
//! engine's command dispatcher. Registration goes through a
//! [`CommandRegistry`] so that it can be observed without a running engine.

use std::ffi::{c_char, c_void, CStr};
use std::fmt;

use tracing::debug;

use crate::module::Installer;
use crate::plugin::Plugin;
use crate::Result;

/// Callback returning a string. The engine copies the result before the next
/// console call.
pub type StringCallback =
    unsafe extern "C" fn(obj: *mut c_void, argc: i32, argv: *const *const c_char) -> *const c_char;
pub type VoidCallback = unsafe extern "C" fn(obj: *mut c_void, argc: i32, argv: *const *const c_char);
pub type IntCallback =
    unsafe extern "C" fn(obj: *mut c_void, argc: i32, argv: *const *const c_char) -> i32;
pub type FloatCallback =
    unsafe extern "C" fn(obj: *mut c_void, argc: i32, argv: *const *const c_char) -> f32;
pub type BoolCallback =
    unsafe extern "C" fn(obj: *mut c_void, argc: i32, argv: *const *const c_char) -> bool;

/// A native console callback, tagged with its return shape.
#[derive(Clone, Copy)]
pub enum ConsoleCallback {
    String(StringCallback),
    Void(VoidCallback),
    Int(IntCallback),
    Float(FloatCallback),
    Bool(BoolCallback),
}

impl ConsoleCallback {
    /// Position of this shape in the engine's `addCommand` overload tables.
    pub fn index(&self) -> usize {
        match self {
            ConsoleCallback::String(_) => 0,
            ConsoleCallback::Void(_) => 1,
            ConsoleCallback::Int(_) => 2,
            ConsoleCallback::Float(_) => 3,
            ConsoleCallback::Bool(_) => 4,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConsoleCallback::String(_) => "string",
            ConsoleCallback::Void(_) => "void",
            ConsoleCallback::Int(_) => "int",
            ConsoleCallback::Float(_) => "float",
            ConsoleCallback::Bool(_) => "bool",
        }
    }
}

impl fmt::Debug for ConsoleCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsoleCallback::{}", self.kind())
    }
}

/// Everything the dispatcher needs to know about one command.
///
/// Argument bounds are passed through as given; the engine checks them when
/// the command is called.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleCommand {
    pub namespace: Option<&'static CStr>,
    pub name: &'static CStr,
    pub callback: ConsoleCallback,
    pub usage: &'static CStr,
    pub min_args: i32,
    pub max_args: i32,
}

impl ConsoleCommand {
    /// `ns::name` or just `name`, for logs.
    pub fn qualified_name(&self) -> String {
        let name = self.name.to_string_lossy();
        match self.namespace {
            Some(ns) => format!("{}::{}", ns.to_string_lossy(), name),
            None => name.into_owned(),
        }
    }
}

/// Receives console command registrations.
pub trait CommandRegistry: Send {
    fn add_command(&self, command: &ConsoleCommand);
}

/// Registers commands with the engine's `Con::addCommand` overloads.
pub struct EngineConsole {
    abi: &'static crate::host::HostAbi,
}

impl EngineConsole {
    pub fn new(abi: &'static crate::host::HostAbi) -> Self {
        EngineConsole { abi }
    }

    /// Engine console for the running platform, if it has one.
    pub fn current() -> Option<Self> {
        crate::host::HostAbi::current().map(Self::new)
    }
}

impl CommandRegistry for EngineConsole {
    #[cfg(target_arch = "x86")]
    fn add_command(&self, command: &ConsoleCommand) {
        let index = command.callback.index();
        let global = self.abi.add_command[index];
        let namespaced = self.abi.add_namespaced_command[index];
        unsafe {
            match command.callback {
                ConsoleCallback::String(cb) => engine_add(global, namespaced, command, cb),
                ConsoleCallback::Void(cb) => engine_add(global, namespaced, command, cb),
                ConsoleCallback::Int(cb) => engine_add(global, namespaced, command, cb),
                ConsoleCallback::Float(cb) => engine_add(global, namespaced, command, cb),
                ConsoleCallback::Bool(cb) => engine_add(global, namespaced, command, cb),
            }
        }
    }

    #[cfg(not(target_arch = "x86"))]
    fn add_command(&self, command: &ConsoleCommand) {
        tracing::warn!(
            "Cannot register {} on {}: engine console is 32-bit only",
            command.qualified_name(),
            self.abi.platform
        );
    }
}

#[cfg(target_arch = "x86")]
unsafe fn engine_add<C: Copy>(global: usize, namespaced: usize, command: &ConsoleCommand, cb: C) {
    use crate::interop::from_ptr;

    match command.namespace {
        None => {
            let add: unsafe extern "C" fn(*const c_char, C, *const c_char, i32, i32) =
                from_ptr(global as *mut c_void);
            add(
                command.name.as_ptr(),
                cb,
                command.usage.as_ptr(),
                command.min_args,
                command.max_args,
            );
        }
        Some(ns) => {
            let add: unsafe extern "C" fn(*const c_char, *const c_char, C, *const c_char, i32, i32) =
                from_ptr(namespaced as *mut c_void);
            add(
                ns.as_ptr(),
                command.name.as_ptr(),
                cb,
                command.usage.as_ptr(),
                command.min_args,
                command.max_args,
            );
        }
    }
}

/// Registry that drops everything. Used when the platform has no engine
/// console.
#[derive(Debug, Default)]
pub struct NullConsole;

impl CommandRegistry for NullConsole {
    fn add_command(&self, command: &ConsoleCommand) {
        debug!("Dropping registration of {}", command.qualified_name());
    }
}

/// Installer that registers one console command.
pub struct ConsoleInstaller {
    command: ConsoleCommand,
}

impl ConsoleInstaller {
    /// A global function.
    pub const fn function(
        name: &'static CStr,
        callback: ConsoleCallback,
        usage: &'static CStr,
        min_args: i32,
        max_args: i32,
    ) -> Self {
        ConsoleInstaller {
            command: ConsoleCommand {
                namespace: None,
                name,
                callback,
                usage,
                min_args,
                max_args,
            },
        }
    }

    /// A method on objects of class `namespace`.
    pub const fn method(
        namespace: &'static CStr,
        name: &'static CStr,
        callback: ConsoleCallback,
        usage: &'static CStr,
        min_args: i32,
        max_args: i32,
    ) -> Self {
        ConsoleInstaller {
            command: ConsoleCommand {
                namespace: Some(namespace),
                name,
                callback,
                usage,
                min_args,
                max_args,
            },
        }
    }

    pub fn command(&self) -> &ConsoleCommand {
        &self.command
    }
}

impl Installer for ConsoleInstaller {
    fn install(&self, plugin: &mut Plugin) -> Result<()> {
        debug!("Registering {}()", self.command.qualified_name());
        plugin.console().add_command(&self.command);
        Ok(())
    }
}

/// Nul-terminated `&'static CStr` from a string literal. A literal with a
/// nul byte inside fails to build.
#[doc(hidden)]
#[macro_export]
macro_rules! __cstr {
    ($s:expr) => {{
        const CSTR: &::std::ffi::CStr =
            match ::std::ffi::CStr::from_bytes_with_nul(concat!($s, "\0").as_bytes()) {
                Ok(s) => s,
                Err(_) => panic!("console strings can't contain nul bytes"),
            };
        CSTR
    }};
}

/// Declares a global console function and adds it to `module`.
///
/// ```ignore
/// console_function!(MY_MODULE, "getSeed", ConsoleCallback::Int(get_seed), "getSeed()", 1, 1);
/// ```
///
/// Names and usage strings end up as C strings, so they can't hold a nul:
///
/// ```compile_fail
/// use std::ffi::{c_char, c_void};
/// use mbextender::console::ConsoleCallback;
/// use mbextender::{console_function, mbx_module};
///
/// mbx_module!(TOOLS);
///
/// unsafe extern "C" fn noop(_obj: *mut c_void, _argc: i32, _argv: *const *const c_char) {}
///
/// console_function!(TOOLS, "no\0op", ConsoleCallback::Void(noop), "noop()", 1, 1);
///
/// fn main() {}
/// ```
#[macro_export]
macro_rules! console_function {
    ($module:path, $name:literal, $callback:expr, $usage:literal, $min:expr, $max:expr $(,)?) => {
        const _: () = {
            static INSTALLER: $crate::console::ConsoleInstaller = $crate::console::ConsoleInstaller::function(
                $crate::__cstr!($name),
                $callback,
                $crate::__cstr!($usage),
                $min,
                $max,
            );

            #[$crate::__private::ctor]
            fn register() {
                $module.add(&INSTALLER);
            }
        };
    };
}

/// Declares a console method on class `namespace` and adds it to `module`.
#[macro_export]
macro_rules! console_method {
    ($module:path, $namespace:literal, $name:literal, $callback:expr, $usage:literal, $min:expr, $max:expr $(,)?) => {
        const _: () = {
            static INSTALLER: $crate::console::ConsoleInstaller = $crate::console::ConsoleInstaller::method(
                $crate::__cstr!($namespace),
                $crate::__cstr!($name),
                $callback,
                $crate::__cstr!($usage),
                $min,
                $max,
            );

            #[$crate::__private::ctor]
            fn register() {
                $module.add(&INSTALLER);
            }
        };
    };
}

/// Declares an override of a host function of type `ty` and adds it to
/// `module`. The trampoline is published in `original` once the module is
/// installed. `target` is evaluated when the library is loaded.
///
/// ```ignore
/// type ShutdownFn = unsafe extern "C" fn();
/// static ORIGINAL_SHUTDOWN: OriginalFn<ShutdownFn> = OriginalFn::new();
/// fn_override!(MY_MODULE, ORIGINAL_SHUTDOWN, ShutdownFn, HostFn::cdecl(0x405E1B), new_shutdown);
/// ```
#[macro_export]
macro_rules! fn_override {
    ($module:path, $original:path, $ty:ty, $target:expr, $replacement:expr $(,)?) => {
        const _: () = {
            #[$crate::__private::ctor]
            fn register() {
                let installer: &'static $crate::interop::OverrideInstaller<$ty> =
                    ::std::boxed::Box::leak(::std::boxed::Box::new($crate::interop::OverrideInstaller::<$ty>::new(
                        stringify!($replacement),
                        $target,
                        $replacement,
                        &$original,
                    )));
                $module.add(installer);
            }
        };
    };
}
