use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};
use tracing::{trace, warn};

use super::CodeAllocator;
use crate::CodeStream;

/// Room reserved per relocated instruction. Short branches can grow into
/// multi-instruction sequences when moved.
const MAX_RELOCATED_LEN: usize = 32;

/// A relocated copy of a function's first instructions followed by a jump
/// back into the function.
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    pub code: *mut u8,
    /// Number of bytes taken from the start of the function.
    pub code_size: usize,
}

/// Builds trampolines for functions that are about to be overwritten.
#[derive(Debug, Clone, Copy)]
pub struct TrampolineGenerator {
    bitness: u32,
}

impl TrampolineGenerator {
    pub fn new(bitness: u32) -> Self {
        TrampolineGenerator { bitness }
    }

    /// Decodes whole instructions from the start of `src` (located at `ip`)
    /// until at least `min_size` bytes are covered.
    ///
    /// Fails on undecodable bytes and on functions that end before
    /// `min_size` bytes.
    pub fn prologue(&self, src: &[u8], ip: u64, min_size: usize) -> Option<(Vec<Instruction>, usize)> {
        let mut decoder = Decoder::with_ip(self.bitness, src, ip, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut size = 0;
        while size < min_size {
            if !decoder.can_decode() {
                warn!("Ran out of code at {:#x}", ip + size as u64);
                return None;
            }
            let instr = decoder.decode();
            if instr.is_invalid() {
                warn!("Invalid instruction at {:#x}", instr.ip());
                return None;
            }
            size += instr.len();
            let ends_function = matches!(
                instr.flow_control(),
                FlowControl::Return
                    | FlowControl::UnconditionalBranch
                    | FlowControl::IndirectBranch
                    | FlowControl::Interrupt
                    | FlowControl::Exception
            );
            instructions.push(instr);
            if ends_function && size < min_size {
                warn!("Function at {:#x} is too short to patch", ip);
                return None;
            }
        }
        Some((instructions, size))
    }

    /// Copies the instructions overwritten by a `min_size`-byte patch at
    /// the start of `src` into new code memory, relocating relative
    /// operands, and appends a jump to the first instruction left intact.
    pub fn create(
        &self,
        allocator: &mut dyn CodeAllocator,
        src: &[u8],
        ip: u64,
        min_size: usize,
    ) -> Option<Trampoline> {
        let (instructions, code_size) = self.prologue(src, ip, min_size)?;
        let capacity = instructions.len() * MAX_RELOCATED_LEN + CodeStream::REL32_JUMP_SIZE;
        let code = allocator.allocate(capacity)?;

        let block = InstructionBlock::new(&instructions, code as u64);
        let encoded = match BlockEncoder::encode(self.bitness, block, BlockEncoderOptions::NONE) {
            Ok(encoded) => encoded.code_buffer,
            Err(e) => {
                warn!("Could not relocate code at {:#x}: {}", ip, e);
                return None;
            }
        };

        let mut stream = unsafe { CodeStream::new(code, capacity) };
        let resume = (ip as usize + code_size) as *const u8;
        if !stream.write(&encoded) || !stream.write_rel32_jump(resume) {
            warn!("Trampoline for {:#x} does not fit", ip);
            return None;
        }
        trace!(
            "Trampoline for {:#x} at {:p}: {} bytes moved, {} emitted",
            ip,
            code,
            code_size,
            stream.offset()
        );
        Some(Trampoline { code, code_size })
    }
}
