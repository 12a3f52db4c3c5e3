//! Address tables for the supported game builds.
//!
//! Everything the loader needs to know about the executable's layout lives
//! in one [`HostAbi`] per platform. Feature plugins carry their own tables.

use std::ffi::c_void;

use tracing::{debug, warn};

use crate::interop::{CallingConvention, HostFn};
use crate::{Error, Result};

/// Entry point of an engine function the loader hooks. The convention tag
/// says how it is really called.
pub type EngineFn = unsafe extern "C" fn();

/// Bytes expected at a fixed address in the supported build.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub address: usize,
    pub bytes: &'static [u8],
}

/// The game's heap entry points. The loader sends all of them to the shared
/// heap so memory can be freed on either side of the plugin boundary.
#[derive(Debug, Clone, Copy)]
pub struct HeapFunctions {
    /// `void *operator new(size_t size, const char *fileName, U32 line)`
    pub op_new: usize,
    pub op_new_array: usize,
    pub op_delete: usize,
    pub op_delete_array: usize,
    /// `void *dMalloc(size_t size)`
    pub d_malloc: usize,
    /// `void *dMalloc_r(size_t size, const char *fileName, U32 line)`
    pub d_malloc_r: usize,
    pub d_realloc: usize,
    pub d_free: usize,
    /// The statically linked CRT.
    pub crt_malloc: usize,
    pub crt_calloc: usize,
    pub crt_realloc: usize,
    pub crt_msize: usize,
    pub crt_free: usize,
}

/// Layout of one game build.
#[derive(Debug, Clone)]
pub struct HostAbi {
    pub platform: &'static str,
    /// Start of the `.text` segment.
    pub text_start: usize,
    pub text_size: usize,
    /// Where plugins are looked for, relative to the working directory.
    pub plugin_dir: &'static str,
    pub signature: Option<Signature>,

    /// `Namespace::init()`: console namespaces are ready.
    pub namespace_init: HostFn<EngineFn>,
    /// `Namespace::shutdown()`, the tail of `Con::shutdown()`.
    pub namespace_shutdown: HostFn<EngineFn>,
    /// `ParticleEngine::init()`, right before main.cs runs.
    pub particle_engine_init: HostFn<EngineFn>,
    /// `ParticleEngine::destroy()`, right after `onExit()`.
    pub particle_engine_destroy: HostFn<EngineFn>,
    /// `bool OpenGLDevice::activate(U32 width, U32 height, U32 bpp, bool fullScreen)`
    pub gl_device_activate: HostFn<EngineFn>,
    /// `void OpenGLDevice::shutdown(bool force)`
    pub gl_device_shutdown: HostFn<EngineFn>,
    pub con_shutdown: HostFn<EngineFn>,
    pub net_shutdown: HostFn<EngineFn>,
    /// `void Con::setBoolVariable(const char *name, bool value)`
    pub set_bool_variable: HostFn<EngineFn>,

    /// `Con::addCommand(name, cb, usage, minArgs, maxArgs)` overloads, in
    /// callback order: string, void, int, float, bool.
    pub add_command: [usize; 5],
    /// `Con::addCommand(nsName, name, cb, usage, minArgs, maxArgs)` overloads.
    pub add_namespaced_command: [usize; 5],

    /// Heap functions to override, if the build needs it.
    pub heap: Option<HeapFunctions>,
}

const fn engine(address: usize) -> HostFn<EngineFn> {
    HostFn::cdecl(address)
}

const fn method(address: usize) -> HostFn<EngineFn> {
    HostFn::new(address, CallingConvention::Thiscall)
}

/// Marble Blast Gold for Windows.
pub static WINDOWS: HostAbi = HostAbi {
    platform: "windows",
    text_start: 0x401000,
    text_size: 0x238000,
    plugin_dir: "plugins",
    signature: Some(Signature {
        address: 0x6796C4,
        bytes: b"Marble Blast",
    }),
    namespace_init: engine(0x407CE3),
    namespace_shutdown: engine(0x4026E9),
    particle_engine_init: engine(0x4093A4),
    particle_engine_destroy: engine(0x40684D),
    gl_device_activate: method(0x4033B9),
    gl_device_shutdown: method(0x40914C),
    con_shutdown: engine(0x405E1B),
    net_shutdown: engine(0x408599),
    set_bool_variable: engine(0x405A38),
    add_command: [0x404F2A, 0x407B8A, 0x4044AD, 0x408972, 0x407527],
    add_namespaced_command: [0x40243C, 0x4080D0, 0x4084C7, 0x404ADE, 0x403698],
    heap: Some(HeapFunctions {
        op_new: 0x409156,
        op_new_array: 0x402879,
        op_delete: 0x404250,
        op_delete_array: 0x4022F7,
        d_malloc: 0x401EC9,
        d_malloc_r: 0x4088C3,
        d_realloc: 0x406BC7,
        d_free: 0x404269,
        crt_malloc: 0x620A10,
        crt_calloc: 0x621D06,
        crt_realloc: 0x621A66,
        crt_msize: 0x622D7C,
        crt_free: 0x620AC2,
    }),
};

/// Marble Blast Gold for macOS.
pub static MACOS: HostAbi = HostAbi {
    platform: "macos",
    text_start: 0x2BC0,
    text_size: 0x290E49,
    plugin_dir: "./Contents/MacOS/plugins",
    signature: None,
    namespace_init: engine(0x348D0),
    namespace_shutdown: engine(0x33960),
    particle_engine_init: engine(0xCC510),
    particle_engine_destroy: engine(0xCAA60),
    gl_device_activate: method(0x1EE2A0),
    gl_device_shutdown: method(0x1EE610),
    con_shutdown: engine(0x39F40),
    net_shutdown: engine(0x1F1080),
    set_bool_variable: engine(0x3BDA0),
    add_command: [0x3A130, 0x3A190, 0x3A250, 0x3A2B0, 0x3A1F0],
    add_namespaced_command: [0x3C5E0, 0x3C6A0, 0x3C760, 0x3C820, 0x3C8E0],
    heap: None,
};

impl HostAbi {
    /// Table for the platform this library was built for.
    pub fn current() -> Option<&'static HostAbi> {
        if cfg!(windows) {
            Some(&WINDOWS)
        } else if cfg!(target_os = "macos") {
            Some(&MACOS)
        } else {
            None
        }
    }

    pub fn text_start(&self) -> *mut u8 {
        self.text_start as *mut u8
    }

    /// Whether `address` lies inside the text segment.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.text_start && address - self.text_start < self.text_size
    }

    /// Checks the signature bytes of the running executable. A build without
    /// a signature always passes.
    pub fn verify(&self) -> Result<()> {
        let Some(signature) = self.signature else {
            return Ok(());
        };
        let ptr = signature.address as *const u8;

        // The address may not even be mapped in an unrelated executable
        let readable = region::query(ptr)
            .map(|r| r.is_readable() && r.as_range().end >= signature.address + signature.bytes.len())
            .unwrap_or(false);
        if !readable {
            warn!("Signature address {:#x} is not mapped", signature.address);
            return Err(Error::UnsupportedGame);
        }

        let actual = unsafe { std::slice::from_raw_parts(ptr, signature.bytes.len()) };
        if actual != signature.bytes {
            warn!("Signature mismatch at {:#x}", signature.address);
            return Err(Error::UnsupportedGame);
        }
        debug!("Signature verified at {:#x}", signature.address);
        Ok(())
    }

    /// Makes the text segment writable so plugins can patch it.
    ///
    /// # Safety
    ///
    /// The segment bounds must be right for the running executable.
    pub unsafe fn unprotect_text(&self) -> Result<()> {
        region::protect(
            self.text_start as *const c_void,
            self.text_size,
            region::Protection::READ_WRITE_EXECUTE,
        )?;
        debug!(
            "Unprotected text segment {:#x}..{:#x}",
            self.text_start,
            self.text_start + self.text_size
        );
        Ok(())
    }
}
