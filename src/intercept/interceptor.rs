use tracing::{debug, trace, warn};

use super::{CodeAllocator, TrampolineGenerator};
use crate::CodeStream;

/// Prologue of a function that only sets up a frame before jumping on:
/// `push ebp; mov ebp, esp; pop ebp`.
const FRAME_THUNK: [u8; 4] = [0x55, 0x89, 0xE5, 0x5D];

/// Longest instruction the decoder may need to look at past the patch.
const DECODE_WINDOW: usize = 32;

/// How a function was redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The function already started with a relative jump or call; its
    /// target was returned and the jump rewritten.
    Thunk,
    /// The function's first instructions were moved into a trampoline.
    Trampoline,
}

#[derive(Debug)]
struct InterceptRecord {
    strategy: Strategy,
    func: *mut u8,
    previous: *mut u8,
    /// Bytes at `func` before the patch, written back on restore.
    original: Vec<u8>,
}

/// Redirects functions inside a code region.
///
/// Intercepts are restored, newest first, when the interceptor is dropped.
pub struct FuncInterceptor {
    stream: CodeStream,
    allocator: Box<dyn CodeAllocator + Send>,
    generator: TrampolineGenerator,
    records: Vec<InterceptRecord>,
}

unsafe impl Send for FuncInterceptor {}

impl FuncInterceptor {
    /// `stream` covers the code that may be patched. `bitness` is 32 for the
    /// game itself.
    pub fn new(stream: CodeStream, allocator: Box<dyn CodeAllocator + Send>, bitness: u32) -> Self {
        FuncInterceptor {
            stream,
            allocator,
            generator: TrampolineGenerator::new(bitness),
            records: Vec::new(),
        }
    }

    /// Routes all calls to `func` to `new_func`. Returns a pointer that
    /// still reaches the original behavior, or `None` if the function can't
    /// be patched.
    pub fn intercept(&mut self, func: *mut u8, new_func: *const u8) -> Option<*mut u8> {
        if func.is_null() || new_func.is_null() {
            return None;
        }
        if !self.stream.contains(func, CodeStream::REL32_JUMP_SIZE) {
            warn!("{:p} is outside of the patchable code", func);
            return None;
        }
        if CodeStream::rel32_displacement(func, new_func).is_none() {
            warn!("{:p} is out of jump range of {:p}", new_func, func);
            return None;
        }

        let thunk = self.find_thunk(func);
        let window_len = self.window_len(func);

        // Save everything the patch might cover before anything is allocated
        let mut saved = vec![0; window_len];
        if !self.stream.seek_to_ptr(func) || !self.stream.read(&mut saved) {
            return None;
        }

        let (strategy, previous, patch_size) = match thunk {
            Some(target) => (Strategy::Thunk, target, CodeStream::REL32_JUMP_SIZE),
            None => {
                let trampoline = self.generator.create(
                    self.allocator.as_mut(),
                    &saved,
                    func as u64,
                    CodeStream::REL32_JUMP_SIZE,
                )?;
                (Strategy::Trampoline, trampoline.code, trampoline.code_size)
            }
        };
        saved.truncate(patch_size);
        let original = saved;

        self.stream.seek_to_ptr(func);
        if !self.stream.write_rel32_jump(new_func) {
            warn!("Could not write jump at {:p}", func);
            return None;
        }
        if patch_size > CodeStream::REL32_JUMP_SIZE {
            // Leave whole instructions behind for anything disassembling the function
            self.stream.write_nops(patch_size - CodeStream::REL32_JUMP_SIZE);
        }

        debug!(
            "Intercepted {:p} -> {:p} ({:?}, previous {:p})",
            func, new_func, strategy, previous
        );
        self.records.push(InterceptRecord {
            strategy,
            func,
            previous,
            original,
        });
        Some(previous)
    }

    /// Undoes every intercept, newest first.
    pub fn restore_all(&mut self) {
        while let Some(record) = self.records.pop() {
            trace!(
                "Restoring {:p} ({:?}, previous {:p})",
                record.func,
                record.strategy,
                record.previous
            );
            if !self.stream.seek_to_ptr(record.func) || !self.stream.write(&record.original) {
                warn!("Could not restore {:p}", record.func);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stream(&self) -> &CodeStream {
        &self.stream
    }

    /// Target of the jump at the start of a thunk, if `func` is one.
    fn find_thunk(&mut self, func: *mut u8) -> Option<*mut u8> {
        if !self.stream.seek_to_ptr(func) {
            return None;
        }
        if let Some(target) = self.stream.peek_rel32_jump() {
            return Some(target);
        }

        let mut prologue = [0; FRAME_THUNK.len()];
        if self.stream.read(&mut prologue) && prologue == FRAME_THUNK {
            return self.stream.peek_rel32_jump();
        }
        None
    }

    /// Bytes the decoder may read at `func` without leaving the stream.
    fn window_len(&self, func: *mut u8) -> usize {
        let offset = func as usize - self.stream.start() as usize;
        DECODE_WINDOW.min(self.stream.size() - offset)
    }
}

impl Drop for FuncInterceptor {
    fn drop(&mut self) {
        self.restore_all();
    }
}
