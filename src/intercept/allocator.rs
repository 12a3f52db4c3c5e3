use tracing::{error, trace};

/// Hands out executable memory for trampolines.
///
/// Memory is never returned individually; it lives as long as the allocator.
pub trait CodeAllocator {
    /// Returns `size` bytes of writable, executable memory.
    fn allocate(&mut self, size: usize) -> Option<*mut u8>;
}

/// Bump allocator over page blocks obtained from the OS.
#[derive(Default)]
pub struct PageAllocator {
    blocks: Vec<region::Allocation>,
    cursor: usize,
    remaining: usize,
}

unsafe impl Send for PageAllocator {}

impl PageAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_available(&mut self, size: usize) -> bool {
        if size <= self.remaining {
            return true;
        }
        match region::alloc(size, region::Protection::READ_WRITE_EXECUTE) {
            Ok(mut block) => {
                self.cursor = block.as_mut_ptr::<u8>() as usize;
                self.remaining = block.len();
                trace!("Allocated {:#x} code bytes at {:#x}", self.remaining, self.cursor);
                self.blocks.push(block);
                true
            }
            Err(e) => {
                error!("Could not allocate code memory: {}", e);
                false
            }
        }
    }
}

impl CodeAllocator for PageAllocator {
    fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if !self.ensure_available(size) {
            return None;
        }
        let result = self.cursor as *mut u8;
        self.cursor += size;
        self.remaining -= size;
        Some(result)
    }
}

/// Bump allocator over a caller-provided region, such as a code cave in the
/// executable.
pub struct CaveAllocator {
    cursor: *mut u8,
    remaining: usize,
}

unsafe impl Send for CaveAllocator {}

impl CaveAllocator {
    /// # Safety
    ///
    /// `start..start + size` must be writable and executable for as long as
    /// the allocator and its allocations are in use.
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        CaveAllocator {
            cursor: start,
            remaining: size,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl CodeAllocator for CaveAllocator {
    fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if size > self.remaining {
            return None;
        }
        let result = self.cursor;
        self.cursor = unsafe { self.cursor.add(size) };
        self.remaining -= size;
        Some(result)
    }
}
