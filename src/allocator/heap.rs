//! The mimalloc heap behind [`super::HEAP`], and the replacements the loader
//! installs over the game's own heap functions.

use std::alloc::{self, Layout};
use std::ffi::{c_char, c_void, CStr};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use libmimalloc_sys as mi;
use tracing::{debug, error};

use super::{new_handler, DEFAULT_ALIGN};
use crate::host::HeapFunctions;
use crate::{Error, Result};

/// `ResManager::setModZip()` allocates its path buffer three bytes short.
const SET_MOD_ZIP_FILE: usize = 0x65D124;
const SET_MOD_ZIP_LINE: u32 = 345;

static REPORTING: AtomicBool = AtomicBool::new(false);

fn allocation_failed(size: usize, file_name: *const c_char, line: u32) {
    // Logging may allocate and fail again
    if REPORTING.swap(true, Ordering::Acquire) {
        return;
    }
    if !file_name.is_null() && line != 0 {
        let file = unsafe { CStr::from_ptr(file_name) }.to_string_lossy();
        error!("Failed to allocate {} bytes at {}:{}", size, file, line);
    } else {
        error!("Failed to allocate {} bytes", size);
    }
    REPORTING.store(false, Ordering::Release);
}

fn out_of_memory(size: usize) -> ! {
    match Layout::from_size_align(size, DEFAULT_ALIGN) {
        Ok(layout) => alloc::handle_alloc_error(layout),
        Err(_) => process::abort(),
    }
}

fn array_size(size: usize, file_name: *const c_char, line: u32) -> usize {
    if file_name as usize == SET_MOD_ZIP_FILE && line == SET_MOD_ZIP_LINE {
        size + 3
    } else {
        size
    }
}

/// `operator new`. Retries through the new-handler; the game can't handle a
/// null result, so running out of memory aborts.
pub unsafe extern "C" fn operator_new(size: usize, file_name: *const c_char, line: u32) -> *mut c_void {
    loop {
        let ptr = mi::mi_malloc(size);
        if !ptr.is_null() {
            return ptr;
        }
        match new_handler() {
            Some(handler) => handler(),
            None => break,
        }
    }
    allocation_failed(size, file_name, line);
    out_of_memory(size)
}

pub unsafe extern "C" fn operator_new_array(size: usize, file_name: *const c_char, line: u32) -> *mut c_void {
    operator_new(array_size(size, file_name, line), file_name, line)
}

/// `operator delete` and `operator delete[]`.
pub unsafe extern "C" fn operator_delete(ptr: *mut c_void) {
    mi::mi_free(ptr)
}

/// `dMalloc_r`, which knows where it was called from.
pub unsafe extern "C" fn malloc_at(size: usize, file_name: *const c_char, line: u32) -> *mut c_void {
    let ptr = mi::mi_malloc(size);
    if ptr.is_null() {
        allocation_failed(size, file_name, line);
    }
    ptr
}

pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    malloc_at(size, std::ptr::null(), 0)
}

pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    let ptr = mi::mi_calloc(count, size);
    if ptr.is_null() {
        allocation_failed(count.saturating_mul(size), std::ptr::null(), 0);
    }
    ptr
}

pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let new = mi::mi_realloc(ptr, size);
    if new.is_null() && size != 0 {
        allocation_failed(size, std::ptr::null(), 0);
    }
    new
}

/// `_msize`: how many bytes the block can really hold.
pub unsafe extern "C" fn msize(ptr: *mut c_void) -> usize {
    mi::mi_usable_size(ptr)
}

pub unsafe extern "C" fn free(ptr: *mut c_void) {
    mi::mi_free(ptr)
}

pub unsafe extern "C" fn malloc_aligned(size: usize, align: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        return std::ptr::null_mut();
    }
    mi::mi_malloc_aligned(size, align)
}

pub unsafe extern "C" fn malloc_zeroed_aligned(size: usize, align: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        return std::ptr::null_mut();
    }
    mi::mi_zalloc_aligned(size, align)
}

pub unsafe extern "C" fn realloc_aligned(ptr: *mut c_void, size: usize, align: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        return std::ptr::null_mut();
    }
    mi::mi_realloc_aligned(ptr, size, align)
}

fn replacements(functions: &HeapFunctions) -> [(usize, *const u8); 13] {
    [
        (functions.op_new, operator_new as usize as *const u8),
        (functions.op_new_array, operator_new_array as usize as *const u8),
        (functions.op_delete, operator_delete as usize as *const u8),
        (functions.op_delete_array, operator_delete as usize as *const u8),
        (functions.crt_malloc, malloc as usize as *const u8),
        (functions.crt_calloc, calloc as usize as *const u8),
        (functions.crt_realloc, realloc as usize as *const u8),
        (functions.crt_msize, msize as usize as *const u8),
        (functions.crt_free, free as usize as *const u8),
        (functions.d_malloc, malloc as usize as *const u8),
        (functions.d_malloc_r, malloc_at as usize as *const u8),
        (functions.d_realloc, realloc as usize as *const u8),
        (functions.d_free, free as usize as *const u8),
    ]
}

/// Sends every function in `functions` to the shared heap. `intercept`
/// redirects one function and returns its trampoline, or `None` if it
/// couldn't.
pub fn install_overrides(
    functions: &HeapFunctions,
    mut intercept: impl FnMut(*mut u8, *const u8) -> Option<*mut u8>,
) -> Result<()> {
    for (address, replacement) in replacements(functions) {
        if intercept(address as *mut u8, replacement).is_none() {
            error!("Could not override heap function at {:#x}", address);
            return Err(Error::InterceptFailed(address));
        }
    }
    debug!("Heap functions overridden");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{mbx_free, mbx_realloc, HEAP};
    use crate::host::WINDOWS;

    #[test]
    fn every_heap_function_is_overridden() {
        let functions = WINDOWS.heap.unwrap();
        let mut seen = Vec::new();
        install_overrides(&functions, |func, new_func| {
            seen.push((func as usize, new_func as usize));
            Some(func)
        })
        .unwrap();

        assert_eq!(seen.len(), 13);
        assert!(seen.contains(&(0x620A10, malloc as usize)));
        assert!(seen.contains(&(0x401EC9, malloc as usize)));
        assert!(seen.contains(&(0x4088C3, malloc_at as usize)));
        assert!(seen.contains(&(0x4022F7, operator_delete as usize)));
        assert!(seen.contains(&(0x622D7C, msize as usize)));
        assert!(seen.contains(&(0x404269, free as usize)));

        let mut targets: Vec<usize> = seen.iter().map(|&(func, _)| func).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), 13);
    }

    #[test]
    fn failed_override_stops_installation() {
        let functions = WINDOWS.heap.unwrap();
        let mut calls = 0;
        let result = install_overrides(&functions, |func, _| {
            calls += 1;
            (func as usize != functions.crt_calloc).then_some(func)
        });
        assert!(matches!(result, Err(Error::InterceptFailed(0x621D06))));
        assert_eq!(calls, 6);
    }

    #[test]
    fn shared_table_is_the_game_heap() {
        assert_eq!(HEAP.malloc as usize, malloc as usize);
        assert_eq!(HEAP.realloc as usize, realloc as usize);
        assert_eq!(HEAP.free as usize, free as usize);
    }

    #[test]
    fn game_blocks_can_be_reallocated_by_plugins() {
        unsafe {
            // What the game's malloc returns once overridden
            let block = malloc(64) as *mut u8;
            assert!(!block.is_null());
            block.write_bytes(0x5A, 64);

            let grown = mbx_realloc(block.cast(), 128) as *mut u8;
            assert!(!grown.is_null());
            assert!(std::slice::from_raw_parts(grown, 64).iter().all(|&b| b == 0x5A));
            assert!(msize(grown.cast()) >= 128);
            mbx_free(grown.cast());
        }
    }

    #[test]
    fn operator_new_blocks_are_freed_by_delete() {
        unsafe {
            let object = operator_new(24, c"marble.cc".as_ptr(), 10) as *mut u8;
            assert!(!object.is_null());
            assert!(msize(object.cast()) >= 24);
            object.write_bytes(0, 24);
            operator_delete(object.cast());

            let array = operator_new_array(10, std::ptr::null(), 0);
            assert!(msize(array) >= 10);
            operator_delete(array);
        }
    }

    #[test]
    fn mod_zip_arrays_get_three_more_bytes() {
        let file = SET_MOD_ZIP_FILE as *const c_char;
        assert_eq!(array_size(20, file, SET_MOD_ZIP_LINE), 23);
        assert_eq!(array_size(20, file, SET_MOD_ZIP_LINE + 1), 20);
        assert_eq!(array_size(20, std::ptr::null(), SET_MOD_ZIP_LINE), 20);
    }

    #[test]
    fn aligned_functions_reject_bad_alignment() {
        unsafe {
            assert!(malloc_zeroed_aligned(8, 24).is_null());
            assert!(realloc_aligned(std::ptr::null_mut(), 8, 0).is_null());
            let p = malloc_zeroed_aligned(64, 128) as *mut u8;
            assert_eq!(p as usize % 128, 0);
            assert!(std::slice::from_raw_parts(p, 64).iter().all(|&b| b == 0));
            free(p.cast());
        }
    }
}
