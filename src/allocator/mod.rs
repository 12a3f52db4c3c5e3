//! Heap shared between the loader and plugins.
//!
//! Memory that crosses the plugin boundary has to come from one heap. The
//! loader exports its allocator table as `MBX_Allocator`; plugins built with
//! the `loader-allocator` feature route every allocation through it, either
//! with the `mbx_*` functions or by installing [`PluginAllocator`] as the
//! global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: mbextender::allocator::PluginAllocator = mbextender::allocator::PluginAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use thiserror::Error;

pub mod heap;

#[cfg(all(feature = "attach", feature = "loader-allocator"))]
compile_error!("the loader can't import its own allocator table");

/// Alignment of blocks returned by `malloc`-style functions.
pub const DEFAULT_ALIGN: usize = 16;

/// Allocator function table.
#[repr(C)]
pub struct AllocatorOperations {
    /// Size of this struct, for versioning.
    pub size: usize,

    pub malloc: unsafe extern "C" fn(size: usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(count: usize, size: usize) -> *mut c_void,
    pub realloc: unsafe extern "C" fn(ptr: *mut c_void, size: usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(ptr: *mut c_void),

    pub malloc_aligned: unsafe extern "C" fn(size: usize, align: usize) -> *mut c_void,
    pub malloc_zeroed_aligned: unsafe extern "C" fn(size: usize, align: usize) -> *mut c_void,
    pub realloc_aligned: unsafe extern "C" fn(ptr: *mut c_void, size: usize, align: usize) -> *mut c_void,
}

/// Table backed by mimalloc. Once the loader has overridden the game's heap
/// functions, `free` and `realloc` accept any block the game hands out.
pub static HEAP: AllocatorOperations = AllocatorOperations {
    size: mem::size_of::<AllocatorOperations>(),
    malloc: heap::malloc,
    calloc: heap::calloc,
    realloc: heap::realloc,
    free: heap::free,
    malloc_aligned: heap::malloc_aligned,
    malloc_zeroed_aligned: heap::malloc_zeroed_aligned,
    realloc_aligned: heap::realloc_aligned,
};

/// Loader export read by plugins.
#[cfg(feature = "attach")]
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static MBX_Allocator: &AllocatorOperations = &HEAP;

#[cfg(feature = "loader-allocator")]
#[link(name = "mbextender")]
extern "C" {
    #[link_name = "MBX_Allocator"]
    static LOADER_ALLOCATOR: &'static AllocatorOperations;
}

static INSTALLED: AtomicPtr<AllocatorOperations> = AtomicPtr::new(ptr::null_mut());

/// Routes the bridge functions through `table` from now on. Memory that is
/// already allocated must still be freed by the table that allocated it.
pub fn install_allocator(table: &'static AllocatorOperations) {
    INSTALLED.store(table as *const _ as *mut _, Ordering::Release);
}

/// The table the bridge functions currently use.
pub fn allocator() -> &'static AllocatorOperations {
    let installed = INSTALLED.load(Ordering::Acquire);
    if !installed.is_null() {
        return unsafe { &*installed };
    }
    default_allocator()
}

#[cfg(feature = "loader-allocator")]
fn default_allocator() -> &'static AllocatorOperations {
    unsafe { LOADER_ALLOCATOR }
}

#[cfg(not(feature = "loader-allocator"))]
fn default_allocator() -> &'static AllocatorOperations {
    &HEAP
}

pub unsafe fn mbx_malloc(size: usize) -> *mut c_void {
    (allocator().malloc)(size)
}

pub unsafe fn mbx_calloc(count: usize, size: usize) -> *mut c_void {
    (allocator().calloc)(count, size)
}

pub unsafe fn mbx_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    (allocator().realloc)(ptr, size)
}

pub unsafe fn mbx_free(ptr: *mut c_void) {
    (allocator().free)(ptr)
}

/// Copies a C string into the shared heap.
pub unsafe fn mbx_strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return ptr::null_mut();
    }
    let bytes = CStr::from_ptr(s).to_bytes_with_nul();
    let copy = mbx_malloc(bytes.len()) as *mut u8;
    if !copy.is_null() {
        ptr::copy_nonoverlapping(bytes.as_ptr(), copy, bytes.len());
    }
    copy as *mut c_char
}

/// Out of memory, after the new-handler gave up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Out of memory allocating {size} bytes")]
pub struct AllocError {
    pub size: usize,
}

/// Called when an allocation fails. It may free memory (and the allocation
/// is retried) or uninstall itself with [`set_new_handler`].
pub type NewHandler = fn();

static NEW_HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Installs a new-handler, returning the previous one.
pub fn set_new_handler(handler: Option<NewHandler>) -> Option<NewHandler> {
    let new = handler.map_or(0, |h| h as usize);
    handler_from(NEW_HANDLER.swap(new, Ordering::AcqRel))
}

pub(crate) fn new_handler() -> Option<NewHandler> {
    handler_from(NEW_HANDLER.load(Ordering::Acquire))
}

fn handler_from(raw: usize) -> Option<NewHandler> {
    match raw {
        0 => None,
        raw => Some(unsafe { mem::transmute::<usize, NewHandler>(raw) }),
    }
}

/// Allocates `size` bytes from the shared heap, calling the new-handler
/// until the allocation succeeds or there is no handler left.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    let size = size.max(1);
    loop {
        if let Some(ptr) = NonNull::new(unsafe { mbx_malloc(size) } as *mut u8) {
            return Ok(ptr);
        }
        match new_handler() {
            Some(handler) => handler(),
            None => return Err(AllocError { size }),
        }
    }
}

/// Like [`allocate`], but returns null instead of an error.
pub fn try_allocate(size: usize) -> *mut u8 {
    allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
}

pub fn allocate_array(size: usize) -> Result<NonNull<u8>, AllocError> {
    allocate(size)
}

pub fn try_allocate_array(size: usize) -> *mut u8 {
    try_allocate(size)
}

/// Frees memory from [`allocate`] or [`try_allocate`]. Null is ignored.
pub unsafe fn deallocate(ptr: *mut u8) {
    mbx_free(ptr as *mut c_void)
}

/// Global allocator routed through the shared heap.
pub struct PluginAllocator;

unsafe impl GlobalAlloc for PluginAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        (allocator().malloc_aligned)(layout.size(), layout.align()).cast()
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        (allocator().malloc_zeroed_aligned)(layout.size(), layout.align()).cast()
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        (allocator().realloc_aligned)(ptr.cast(), new_size, layout.align()).cast()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        (allocator().free)(ptr.cast())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[test]
    fn malloc_is_aligned_and_usable() {
        unsafe {
            let p = (HEAP.malloc)(100) as *mut u8;
            assert!(!p.is_null());
            assert_eq!(p as usize % DEFAULT_ALIGN, 0);
            p.write_bytes(0xAB, 100);
            (HEAP.free)(p.cast());
        }
    }

    #[test]
    fn aligned_allocations_honor_alignment() {
        unsafe {
            for align in [1, 8, 64, 4096] {
                let p = (HEAP.malloc_aligned)(24, align);
                assert_eq!(p as usize % align, 0, "align {align}");
                (HEAP.free)(p);
            }
            assert!((HEAP.malloc_aligned)(8, 3).is_null());
        }
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        unsafe {
            let p = (HEAP.calloc)(16, 4) as *mut u8;
            assert!(std::slice::from_raw_parts(p, 64).iter().all(|&b| b == 0));
            (HEAP.free)(p.cast());
            assert!((HEAP.calloc)(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn realloc_keeps_contents() {
        unsafe {
            let p = (HEAP.malloc_aligned)(4, 64) as *mut u8;
            p.copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4);
            let q = (HEAP.realloc_aligned)(p.cast(), 256, 64) as *mut u8;
            assert_eq!(q as usize % 64, 0);
            assert_eq!(std::slice::from_raw_parts(q, 4), [1, 2, 3, 4]);
            let r = (HEAP.realloc)(q.cast(), 2) as *mut u8;
            assert_eq!(std::slice::from_raw_parts(r, 2), [1, 2]);
            (HEAP.free)(r.cast());
            (HEAP.free)(ptr::null_mut());
        }
    }

    #[test]
    fn strdup_copies_string() {
        unsafe {
            let copy = mbx_strdup(c"marble".as_ptr());
            assert_eq!(CStr::from_ptr(copy).to_str().unwrap(), "marble");
            mbx_free(copy.cast());
            assert!(mbx_strdup(ptr::null()).is_null());
        }
    }

    #[test]
    fn plugin_allocator_backs_collections() {
        let layout = Layout::from_size_align(40, 32).unwrap();
        unsafe {
            let p = PluginAllocator.alloc_zeroed(layout);
            assert_eq!(p as usize % 32, 0);
            assert_eq!(*p.add(39), 0);
            let q = PluginAllocator.realloc(p, layout, 80);
            assert_eq!(q as usize % 32, 0);
            PluginAllocator.dealloc(q, Layout::from_size_align(80, 32).unwrap());
        }
    }

    static HANDLER_CALLS: AtomicU32 = AtomicU32::new(0);

    fn give_up_after_three() {
        if HANDLER_CALLS.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            set_new_handler(None);
        }
    }

    #[test]
    fn failed_allocation_retries_through_new_handler() {
        let huge = isize::MAX as usize;

        assert!(try_allocate(huge).is_null());

        let previous = set_new_handler(Some(give_up_after_three));
        assert!(previous.is_none());
        assert_eq!(allocate_array(huge), Err(AllocError { size: huge }));
        assert_eq!(HANDLER_CALLS.load(Ordering::SeqCst), 3);
        assert!(set_new_handler(None).is_none());

        let ok = allocate(32).unwrap();
        unsafe { deallocate(ok.as_ptr()) };
    }
}
