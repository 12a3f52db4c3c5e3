//! Typed handles to functions and globals inside the game executable.
//!
//! Every handle is just an address plus a type; the address tables live in
//! [`crate::host`] and in feature plugins. Nothing here checks that an
//! address is right for the running build.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error};

use crate::module::Installer;
use crate::plugin::Plugin;
use crate::Result;

/// Calling convention of a host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    /// Arguments in ECX/EDX (regparm on macOS).
    Fastcall,
    /// `this` in ECX on Windows, first stack argument elsewhere.
    Thiscall,
}

/// Address of a host function with signature `T`.
///
/// `T` is expected to be an `unsafe extern fn` pointer type matching the
/// calling convention tag.
#[derive(Debug)]
pub struct HostFn<T> {
    address: usize,
    convention: CallingConvention,
    _marker: PhantomData<T>,
}

impl<T> Clone for HostFn<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HostFn<T> {}

impl<T> HostFn<T> {
    pub const fn new(address: usize, convention: CallingConvention) -> Self {
        HostFn {
            address,
            convention,
            _marker: PhantomData,
        }
    }

    pub const fn cdecl(address: usize) -> Self {
        Self::new(address, CallingConvention::Cdecl)
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.address as *mut c_void
    }

    /// # Safety
    ///
    /// The address must hold a function with exactly the signature `T`.
    ///
    /// `T` has to be pointer-sized, which is checked at compile time:
    ///
    /// ```compile_fail
    /// let f = mbextender::HostFn::<u8>::cdecl(0x401000);
    /// let _ = unsafe { f.get() };
    /// ```
    pub unsafe fn get(&self) -> T
    where
        T: Copy,
    {
        from_ptr(self.as_ptr())
    }
}

/// Address of a host global of type `T`.
#[derive(Debug)]
pub struct HostVar<T> {
    address: usize,
    _marker: PhantomData<T>,
}

impl<T> HostVar<T> {
    pub const fn new(address: usize) -> Self {
        HostVar {
            address,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.address as *mut T
    }

    /// # Safety
    ///
    /// The address must hold an initialized `T`.
    pub unsafe fn read(&self) -> T {
        self.as_ptr().read_unaligned()
    }

    /// # Safety
    ///
    /// The address must hold a writable `T`.
    pub unsafe fn write(&self, value: T) {
        self.as_ptr().write_unaligned(value)
    }
}

/// Slot receiving the trampoline of an overridden function.
pub struct OriginalFn<T> {
    address: AtomicUsize,
    _marker: PhantomData<T>,
}

impl<T: Copy> OriginalFn<T> {
    pub const fn new() -> Self {
        OriginalFn {
            address: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn set(&self, func: T) {
        self.address
            .store(erase(func) as usize, Ordering::Release);
    }

    /// The trampoline, or `None` until the override has been installed.
    pub fn get(&self) -> Option<T> {
        match self.address.load(Ordering::Acquire) {
            0 => None,
            address => Some(unsafe { from_ptr(address as *mut c_void) }),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.address.load(Ordering::Acquire) != 0
    }
}

impl<T: Copy> Default for OriginalFn<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Installer that intercepts `target` with `replacement` and publishes the
/// trampoline through `original`. Declared with [`crate::fn_override!`].
pub struct OverrideInstaller<T: 'static> {
    name: &'static str,
    target: HostFn<T>,
    replacement: T,
    original: &'static OriginalFn<T>,
}

impl<T: 'static> OverrideInstaller<T> {
    pub const fn new(
        name: &'static str,
        target: HostFn<T>,
        replacement: T,
        original: &'static OriginalFn<T>,
    ) -> Self {
        OverrideInstaller {
            name,
            target,
            replacement,
            original,
        }
    }
}

impl<T: Copy + Send + Sync + 'static> Installer for OverrideInstaller<T> {
    fn install(&self, plugin: &mut Plugin) -> Result<()> {
        debug!("Overriding {} at {:#x}", self.name, self.target.address());
        match plugin.intercept(self.target, self.replacement) {
            Ok(trampoline) => {
                self.original.set(trampoline);
                Ok(())
            }
            Err(e) => {
                error!("Could not override {}: {}", self.name, e);
                Err(e)
            }
        }
    }
}

struct PointerSized<T>(PhantomData<T>);

impl<T> PointerSized<T> {
    /// Fails to build for any `T` that isn't the size of a pointer.
    const CHECK: () = assert!(
        mem::size_of::<T>() == mem::size_of::<*mut c_void>(),
        "function pointer types only"
    );
}

/// Type-erases a function pointer.
pub(crate) fn erase<T: Copy>(func: T) -> *mut c_void {
    let () = PointerSized::<T>::CHECK;
    unsafe { mem::transmute_copy(&func) }
}

/// Inverse of [`erase`].
pub(crate) unsafe fn from_ptr<T: Copy>(ptr: *mut c_void) -> T {
    let () = PointerSized::<T>::CHECK;
    mem::transmute_copy(&ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHost;

    extern "C" fn double(x: i32) -> i32 {
        x * 2
    }

    #[test]
    fn host_fn_round_trips_function_pointers() {
        let f: HostFn<extern "C" fn(i32) -> i32> = HostFn::cdecl(double as usize);
        assert_eq!(f.convention(), CallingConvention::Cdecl);
        let g = unsafe { f.get() };
        assert_eq!(g(21), 42);
    }

    #[test]
    fn original_fn_starts_empty() {
        static SLOT: OriginalFn<extern "C" fn(i32) -> i32> = OriginalFn::new();
        assert!(SLOT.get().is_none());
        SLOT.set(double);
        assert!(SLOT.is_installed());
        assert_eq!((SLOT.get().unwrap())(4), 8);
    }

    #[test]
    fn erased_pointers_come_back_unchanged() {
        let erased = erase(double as extern "C" fn(i32) -> i32);
        assert_eq!(erased as usize, double as usize);
        let back: extern "C" fn(i32) -> i32 = unsafe { from_ptr(erased) };
        assert_eq!(back(5), 10);
    }

    #[test]
    fn host_var_reads_and_writes() {
        let mut value = 7u32;
        let var = HostVar::<u32>::new(&mut value as *mut u32 as usize);
        unsafe {
            assert_eq!(var.read(), 7);
            var.write(9);
        }
        assert_eq!(value, 9);
    }

    type Hook = extern "C" fn();

    #[test]
    fn override_installer_publishes_trampoline() {
        let fake = FakeHost::new(64);
        let mut plugin = fake.plugin();
        let start = fake.code_start();
        let (old, new) = unsafe { (start.add(0x100), start.add(0x200)) };
        assert!(plugin.code_stream().write_rel32_jump(old));

        let slot: &'static OriginalFn<Hook> = Box::leak(Box::new(OriginalFn::new()));
        let replacement: Hook = unsafe { from_ptr(new.cast()) };
        let installer = OverrideInstaller::new("shutdown", HostFn::cdecl(start as usize), replacement, slot);
        installer.install(&mut plugin).unwrap();
        assert_eq!(slot.get().map(|f| f as usize), Some(old as usize));
    }

    #[test]
    fn failed_override_leaves_slot_empty() {
        let fake = FakeHost::new(64);
        let mut plugin = fake.plugin();
        let slot: &'static OriginalFn<Hook> = Box::leak(Box::new(OriginalFn::new()));
        let installer = OverrideInstaller::new("nowhere", HostFn::cdecl(0), on_nothing as Hook, slot);
        assert!(matches!(installer.install(&mut plugin), Err(crate::Error::InterceptFailed(0))));
        assert!(!slot.is_installed());
    }

    extern "C" fn on_nothing() {}
}
