//! Byte-level editor for a block of machine code.
//!
//! A [`CodeStream`] is a cursor over a fixed region of memory, normally the
//! game's `.text` segment. Every operation that would move the cursor past the
//! end of the region is refused as a whole: nothing is written and the cursor
//! stays where it was. The only exception is [`CodeStream::skip`], which
//! clamps to the end.
//!
//! The stream understands exactly two instructions, the 5-byte relative
//! `jmp` (`E9`) and `call` (`E8`). Everything else is opaque bytes.

use std::ptr;

const REL32_JUMP_OPCODE: u8 = 0xE9;
const REL32_CALL_OPCODE: u8 = 0xE8;
const NOP_OPCODE: u8 = 0x90;

/// Cursor over a writable block of code.
pub struct CodeStream {
    start: *mut u8,
    size: usize,
    offset: usize,
}

// The stream only ever touches memory inside `start..start + size`, which the
// creator guarantees stays mapped for the lifetime of the stream.
unsafe impl Send for CodeStream {}

impl CodeStream {
    /// Size of an instruction written by [`CodeStream::write_rel32_jump`] and
    /// [`CodeStream::write_rel32_call`].
    pub const REL32_JUMP_SIZE: usize = 5;

    /// Creates a stream over `size` bytes starting at `start`, positioned at
    /// offset 0.
    ///
    /// # Safety
    ///
    /// `start..start + size` must be readable and writable for as long as the
    /// stream exists.
    pub unsafe fn new(start: *mut u8, size: usize) -> Self {
        CodeStream {
            start,
            size,
            offset: 0,
        }
    }

    /// Copies `data` to the current position and advances past it.
    /// Returns `false` without writing anything if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.is_space_available(data.len()) {
            return false;
        }
        // `data` may alias the region
        unsafe { ptr::copy(data.as_ptr(), self.cursor(), data.len()) };
        self.offset += data.len();
        true
    }

    /// Fills `out` from the current position and advances past it.
    /// Returns `false` without copying or advancing if not enough bytes remain.
    pub fn read(&mut self, out: &mut [u8]) -> bool {
        if !self.is_space_available(out.len()) {
            return false;
        }
        unsafe { ptr::copy_nonoverlapping(self.cursor(), out.as_mut_ptr(), out.len()) };
        self.offset += out.len();
        true
    }

    /// Decodes a relative 32-bit jump or call at the current position and
    /// advances past it. Returns the absolute target, or `None` (without
    /// moving) if there is no such instruction here.
    pub fn read_rel32_jump(&mut self) -> Option<*mut u8> {
        let target = self.peek_rel32_jump()?;
        self.skip(Self::REL32_JUMP_SIZE);
        Some(target)
    }

    /// Same as [`CodeStream::read_rel32_jump`] but never moves the cursor.
    pub fn peek_rel32_jump(&self) -> Option<*mut u8> {
        if !self.is_space_available(Self::REL32_JUMP_SIZE) {
            return None;
        }

        let mut insn = [0u8; Self::REL32_JUMP_SIZE];
        unsafe { ptr::copy_nonoverlapping(self.cursor(), insn.as_mut_ptr(), insn.len()) };
        if insn[0] != REL32_JUMP_OPCODE && insn[0] != REL32_CALL_OPCODE {
            return None;
        }

        // target = address of next instruction + displacement
        let displacement = i32::from_le_bytes([insn[1], insn[2], insn[3], insn[4]]);
        Some(
            self.cursor()
                .wrapping_add(Self::REL32_JUMP_SIZE)
                .wrapping_offset(displacement as isize),
        )
    }

    /// Writes `jmp target` at the current position and advances past it.
    pub fn write_rel32_jump(&mut self, target: *const u8) -> bool {
        self.write_rel32(REL32_JUMP_OPCODE, target)
    }

    /// Writes `call target` at the current position and advances past it.
    pub fn write_rel32_call(&mut self, target: *const u8) -> bool {
        self.write_rel32(REL32_CALL_OPCODE, target)
    }

    fn write_rel32(&mut self, opcode: u8, target: *const u8) -> bool {
        if !self.is_space_available(Self::REL32_JUMP_SIZE) {
            return false;
        }

        let Some(displacement) = Self::rel32_displacement(self.cursor(), target) else {
            return false;
        };

        let mut insn = [opcode, 0, 0, 0, 0];
        insn[1..].copy_from_slice(&displacement.to_le_bytes());
        self.write(&insn)
    }

    /// Displacement of a jump or call at `at` to `target`, or `None` if the
    /// target is more than 2 GiB away (only possible on 64-bit hosts).
    pub fn rel32_displacement(at: *const u8, target: *const u8) -> Option<i32> {
        // displacement = target - address of next instruction
        let next = (at as usize).wrapping_add(Self::REL32_JUMP_SIZE);
        i32::try_from((target as usize).wrapping_sub(next) as isize).ok()
    }

    /// Fills `count` bytes with `nop` and advances past them.
    pub fn write_nops(&mut self, count: usize) -> bool {
        if !self.is_space_available(count) {
            return false;
        }
        unsafe { ptr::write_bytes(self.cursor(), NOP_OPCODE, count) };
        self.offset += count;
        true
    }

    /// Moves the cursor to `offset` bytes from the start of the region.
    /// Refused if `offset` is past the end.
    pub fn seek_to(&mut self, offset: usize) -> bool {
        if offset > self.size {
            return false;
        }
        self.offset = offset;
        true
    }

    /// Moves the cursor to `ptr`, which must lie inside the region (the end
    /// address is allowed).
    pub fn seek_to_ptr(&mut self, ptr: *const u8) -> bool {
        let offset = (ptr as usize).wrapping_sub(self.start as usize);
        self.seek_to(offset)
    }

    /// Advances by up to `count` bytes, stopping at the end of the region.
    pub fn skip(&mut self, count: usize) {
        if self.is_space_available(count) {
            self.offset += count;
        } else {
            self.offset = self.size;
        }
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of the byte under the cursor.
    pub fn position(&self) -> *mut u8 {
        self.cursor()
    }

    pub fn is_at_end(&self) -> bool {
        self.offset == self.size
    }

    /// Whether `[start, start + len)` lies entirely inside the region.
    pub fn contains(&self, start: *const u8, len: usize) -> bool {
        let offset = (start as usize).wrapping_sub(self.start as usize);
        offset <= self.size && self.size - offset >= len
    }

    fn cursor(&self) -> *mut u8 {
        self.start.wrapping_add(self.offset)
    }

    fn is_space_available(&self, needed: usize) -> bool {
        self.size - self.offset >= needed
    }
}
