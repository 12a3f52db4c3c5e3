//! Chained intercepts: F is intercepted by G, then again by H, and each
//! replacement reaches the one before it through its trampoline.

use mbextender::intercept::{CaveAllocator, FuncInterceptor};
use mbextender::CodeStream;

const CODE_SIZE: usize = 0x100;
const CAVE_SIZE: usize = 0x300;
const G: usize = 0x20;
const H: usize = 0x40;

// mov eax, edi; add eax, 1; ret
const ADD_ONE: [u8; 6] = [0x89, 0xF8, 0x83, 0xC0, 0x01, 0xC3];

struct Region {
    interceptor: FuncInterceptor,
    start: *mut u8,
}

impl Region {
    /// # Safety
    ///
    /// `start` must be valid for `CODE_SIZE + CAVE_SIZE` bytes.
    unsafe fn new(start: *mut u8) -> Self {
        start.copy_from_nonoverlapping(ADD_ONE.as_ptr(), ADD_ONE.len());
        let stream = CodeStream::new(start, CODE_SIZE);
        let cave = CaveAllocator::new(start.add(CODE_SIZE), CAVE_SIZE);
        Region {
            interceptor: FuncInterceptor::new(stream, Box::new(cave), 64),
            start,
        }
    }

    fn at(&self, offset: usize) -> *mut u8 {
        unsafe { self.start.add(offset) }
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.at(offset), len) }
    }

    fn jump_target(&self, at: *mut u8) -> Option<*mut u8> {
        unsafe { CodeStream::new(at, 5) }.peek_rel32_jump()
    }

    /// `call target` followed by `tail`.
    fn emit_wrapper(&self, offset: usize, target: *const u8, tail: &[u8]) {
        let mut stream = unsafe { CodeStream::new(self.at(offset), 0x20) };
        assert!(stream.write_rel32_call(target));
        assert!(stream.write(tail));
    }
}

#[test]
fn second_intercept_receives_first_replacement() {
    let mut buf = vec![0xCC_u8; CODE_SIZE + CAVE_SIZE];
    let mut code = unsafe { Region::new(buf.as_mut_ptr()) };
    let f = code.at(0);

    let original = code.interceptor.intercept(f, code.at(G)).unwrap();
    assert_eq!(code.jump_target(f), Some(code.at(G)));
    // The moved mov/add pair, then a jump back to the ret
    assert_eq!(unsafe { std::slice::from_raw_parts(original, 5) }, &ADD_ONE[..5]);
    assert_eq!(code.jump_target(unsafe { original.add(5) }), Some(code.at(5)));

    let previous = code.interceptor.intercept(f, code.at(H)).unwrap();
    assert_eq!(previous, code.at(G));
    assert_eq!(code.jump_target(f), Some(code.at(H)));
    assert_eq!(code.interceptor.len(), 2);

    code.interceptor.restore_all();
    assert_eq!(code.bytes(0, ADD_ONE.len()), &ADD_ONE[..]);
    drop(code);
    drop(buf);
}

#[test]
fn restoring_twice_is_harmless() {
    let mut buf = vec![0xCC_u8; CODE_SIZE + CAVE_SIZE];
    let mut code = unsafe { Region::new(buf.as_mut_ptr()) };
    let f = code.at(0);
    code.interceptor.intercept(f, code.at(G)).unwrap();

    code.interceptor.restore_all();
    code.interceptor.restore_all();
    assert!(code.interceptor.is_empty());
    assert_eq!(code.bytes(0, ADD_ONE.len()), &ADD_ONE[..]);
    drop(code);
    drop(buf);
}

/// Runs the chain for real: F(x) = x + 1, G(x) = F(x) * 2, H(x) = G(x) + 100.
#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn chained_hooks_forward_to_the_original() {
    let mut memory = region::alloc(CODE_SIZE + CAVE_SIZE, region::Protection::READ_WRITE_EXECUTE)
        .expect("executable memory");
    let mut code = unsafe { Region::new(memory.as_mut_ptr::<u8>()) };
    let f = code.at(0);
    let call_f = || {
        let func: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(f) };
        func(5)
    };
    assert_eq!(call_f(), 6);

    let original = code.interceptor.intercept(f, code.at(G)).unwrap();
    // add eax, eax; ret
    code.emit_wrapper(G, original, &[0x01, 0xC0, 0xC3]);
    assert_eq!(call_f(), 12);

    let previous = code.interceptor.intercept(f, code.at(H)).unwrap();
    // add eax, 100; ret
    code.emit_wrapper(H, previous, &[0x83, 0xC0, 0x64, 0xC3]);
    assert_eq!(call_f(), 112);

    code.interceptor.restore_all();
    assert_eq!(call_f(), 6);
    drop(code);
}
