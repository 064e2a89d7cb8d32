//! # Mid Hook
//!
//! Redirects execution at an arbitrary instruction boundary into a trampoline that saves every register,
//! runs a [`Handler`] on them, restores them, runs the instructions the jump displaced and jumps back.
//!
//! Hooks are permanent. The host may reach a hooked site at any point until it exits, so the trampoline
//! and handler of an installed hook are leaked.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::{Mutex, PoisonError};

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use lazy_static::lazy_static;
use region::Protection;

use crate::alloc::{self, ExecutableMemory};
use crate::code::x64::{self, JMP_ABS_LEN, JMP_REL32_LEN};
use crate::patcher::byte::AtomicPatcher;
use crate::patcher::mem::PermissionWrapper;
use crate::patcher::Patcher;

use super::{Handler, HookError, Registers};

/// Bytes reserved for each trampoline
const TRAMPOLINE_SIZE: usize = 1024;

/// Longest possible x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

lazy_static! {
    /// Jumps written by installed hooks
    static ref INSTALLED: Mutex<Vec<InstalledJump>> = Mutex::new(Vec::new());
}

/// The bytes a hook wrote over its target
struct InstalledJump {
    /// Hooked address
    address: usize,
    /// Jump and padding, exactly as written
    bytes: Vec<u8>,
}

impl InstalledJump {
    /// Byte range the jump occupies
    fn range(&self) -> Range<usize> {
        self.address..self.address + self.bytes.len()
    }

    /// True while the target still holds this jump. Fails once the memory is unmapped or rewritten.
    fn is_live(&self) -> bool {
        let range = self.range();
        if !is_readable(range.start) || !is_readable(range.end - 1) {
            return false;
        }
        // Safety: both ends of the range are mapped and readable
        unsafe { slice::from_raw_parts(range.start as *const u8, self.bytes.len()) == &self.bytes[..] }
    }
}

/// True if the page holding `address` is mapped and readable
fn is_readable(address: usize) -> bool {
    region::query(address as *const u8)
        .map(|region| region.protection().contains(Protection::READ))
        .unwrap_or(false)
}

/// Executable memory holding a hook's trampoline
enum Trampoline {
    /// Allocated within `jmp rel32` range of the target
    Near(ExecutableMemory),
    /// Allocated anywhere, reached with an absolute jump
    Far(region::Allocation),
}

impl Trampoline {
    /// Allocates a trampoline, preferring memory close to `origin`
    fn allocate(origin: usize) -> Result<Self, HookError> {
        match alloc::allocate_executable(origin, TRAMPOLINE_SIZE) {
            Ok(memory) => Ok(Self::Near(memory)),
            Err(error) => {
                tracing::debug!("No trampoline memory near 0x{origin:x} ({error}), allocating anywhere");
                region::alloc(TRAMPOLINE_SIZE, Protection::READ_WRITE_EXECUTE)
                    .map(Self::Far)
                    .map_err(HookError::FarAllocation)
            }
        }
    }

    /// Address of the first byte
    fn address(&self) -> usize {
        match self {
            Self::Near(memory) => memory.address(),
            Self::Far(allocation) => allocation.as_ptr::<u8>() as usize,
        }
    }

    /// Writable view of the trampoline
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Near(memory) => &mut memory[..],
            Self::Far(allocation) => unsafe {
                slice::from_raw_parts_mut(allocation.as_mut_ptr::<u8>(), allocation.len())
            },
        }
    }
}

/// An installed mid-function hook
pub struct MidHook {
    /// Hooked instruction
    target: usize,
    /// Number of original bytes replaced by the jump
    displaced: usize,
    /// Code the target jumps to
    trampoline: Trampoline,
    /// Called by the trampoline through [`dispatch`]. Boxed twice so the trampoline can hold a thin pointer.
    #[allow(dead_code)]
    handler: Box<Handler>,
}

impl MidHook {
    /// Installs a hook at `address` that runs `handler` before the instruction at `address`.
    ///
    /// Whole instructions covering the jump are moved into the trampoline and run after the handler, with
    /// the register state the handler left behind. The returned hook lives until the process exits.
    ///
    /// # Safety
    ///
    /// `address` must be the start of an instruction, and no thread may be executing inside the bytes the
    /// jump replaces unless they fit in one aligned qword. Nothing may branch into the middle of those bytes.
    pub unsafe fn install(address: usize, handler: Handler) -> Result<&'static MidHook, HookError> {
        if !cfg!(target_arch = "x86_64") {
            return Err(HookError::UnsupportedArchitecture);
        }

        let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
        installed.retain(InstalledJump::is_live);
        if installed.iter().any(|jump| jump.range().contains(&address)) {
            return Err(HookError::AlreadyHooked { address });
        }

        let region = region::query(address as *const u8)
            .map_err(|source| HookError::Query { address, source })?;
        if !region.protection().contains(Protection::EXECUTE) {
            return Err(HookError::NotExecutable { address });
        }

        let mut trampoline = Trampoline::allocate(address)?;
        let jump_len = match x64::jmp_rel32(address, trampoline.address()) {
            Some(_) => JMP_REL32_LEN,
            None => JMP_ABS_LEN,
        };

        // never read past the end of the target's region
        let region_end = region.as_ptr::<u8>() as usize + region.len();
        let readable = (jump_len + MAX_INSTRUCTION_LEN).min(region_end - address);
        let code = slice::from_raw_parts(address as *const u8, readable);
        let displaced = decode_displaced(address, jump_len, code)?;
        let displaced_len: usize = displaced.iter().map(Instruction::len).sum();

        let patched = address..address + displaced_len;
        if installed.iter().any(|jump| {
            let range = jump.range();
            range.start < patched.end && patched.start < range.end
        }) {
            return Err(HookError::AlreadyHooked { address });
        }

        let handler = Box::new(handler);
        let stub = x64::mid_hook_stub(
            trampoline.address() as u64,
            dispatch as usize as u64,
            &*handler as *const Handler as u64,
            &displaced,
            patched.end as u64,
        )?;
        let slot = trampoline.as_mut_slice();
        if stub.len() > slot.len() {
            return Err(HookError::TrampolineTooSmall {
                needed: stub.len(),
                available: slot.len(),
            });
        }
        slot[..stub.len()].copy_from_slice(&stub);

        let jump = x64::hook_jump(address, trampoline.address(), displaced_len).ok_or(
            HookError::Unreachable {
                address,
                trampoline: trampoline.address(),
            },
        )?;
        PermissionWrapper::new(AtomicPatcher::new()).patch(address as *mut u8, &jump)?;
        flush_instruction_cache(address, jump.len());

        installed.push(InstalledJump {
            address,
            bytes: jump,
        });
        Ok(Box::leak(Box::new(MidHook {
            target: address,
            displaced: displaced_len,
            trampoline,
            handler,
        })))
    }

    /// Hooked address
    pub fn target(&self) -> usize {
        self.target
    }

    /// Number of original bytes moved into the trampoline
    pub fn displaced_len(&self) -> usize {
        self.displaced
    }

    /// Address of the trampoline the target now jumps to
    pub fn trampoline(&self) -> usize {
        self.trampoline.address()
    }
}

/// Decodes whole instructions from `code` (located at `address`) until at least `needed` bytes are covered
pub fn decode_displaced(
    address: usize,
    needed: usize,
    code: &[u8],
) -> Result<Vec<Instruction>, HookError> {
    let mut decoder = Decoder::with_ip(64, code, address as u64, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut len = 0;
    while len < needed {
        if !decoder.can_decode() {
            return Err(HookError::Decode {
                address: address + len,
            });
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::Decode {
                address: address + len,
            });
        }
        len += instruction.len();

        // whatever follows a return or jump may not belong to this function
        let ends_flow = matches!(
            instruction.flow_control(),
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        );
        instructions.push(instruction);
        if ends_flow && len < needed {
            return Err(HookError::TooShort { address });
        }
    }
    Ok(instructions)
}

/// Entry point of every trampoline
///
/// Panics must not unwind into host code, so they end here and leave the registers as the handler left them.
unsafe extern "C" fn dispatch(registers: *mut Registers, handler: *const Handler) {
    let registers = &mut *registers;
    let handler = &*handler;
    let _ = panic::catch_unwind(AssertUnwindSafe(|| handler(registers)));
}

/// Makes sure no stale instructions are fetched from a freshly patched range
#[cfg(windows)]
fn flush_instruction_cache(address: usize, len: usize) {
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Threading::GetCurrentProcess;

    // x86 keeps instruction fetch coherent with stores, this is only a hint
    let _ = unsafe { FlushInstructionCache(GetCurrentProcess(), Some(address as _), len) };
}

/// Makes sure no stale instructions are fetched from a freshly patched range
#[cfg(not(windows))]
fn flush_instruction_cache(_address: usize, _len: usize) {}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;

    /// `mov eax, 7`, 16 `nop`s, `ret`
    const FUNCTION: [u8; 22] = [
        0xb8, 0x07, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90, 0x90, 0x90, 0x90, 0xc3,
    ];

    /// 16 `nop`s, `ret`. Returns its float argument.
    const IDENTITY: [u8; 17] = [
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xc3,
    ];

    /// Where [`STORE`] writes its argument, relative to the start of the page
    const STORED: usize = 0x100;

    /// `movss [rip + 0xf8], xmm0` (page offset 0x100), 12 `nop`s, `ret`
    const STORE: [u8; 21] = [
        0xf3, 0x0f, 0x11, 0x05, 0xf8, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
        0x90, 0x90, 0x90, 0x90, 0xc3,
    ];

    /// Copies `code` into a fresh executable page. Hooks are never removed, so the page is leaked.
    fn code_page(code: &[u8]) -> &'static region::Allocation {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE_EXECUTE).unwrap();
        unsafe {
            slice::from_raw_parts_mut(page.as_mut_ptr::<u8>(), code.len()).copy_from_slice(code);
        }
        Box::leak(Box::new(page))
    }

    /// Start of `page`
    fn start(page: &region::Allocation) -> usize {
        page.as_ptr::<u8>() as usize
    }

    /// Calls the code at the start of `page`
    fn call(page: &region::Allocation) -> u32 {
        let function: extern "C" fn() -> u32 = unsafe { std::mem::transmute(page.as_ptr::<u8>()) };
        function()
    }

    /// Calls the code at the start of `page` with a float argument
    fn call_f32(page: &region::Allocation, value: f32) -> f32 {
        let function: extern "C" fn(f32) -> f32 = unsafe { std::mem::transmute(page.as_ptr::<u8>()) };
        function(value)
    }

    #[test]
    /// A handler's register writes are visible to the code after the hook
    fn test_set_register() {
        let page = code_page(&FUNCTION);
        let address = start(page) + 5;

        // sanity check
        assert_eq!(call(page), 7);

        let hook = unsafe {
            MidHook::install(address, Box::new(|registers: &mut Registers| registers.rax = 42)).unwrap()
        };
        assert_eq!(hook.target(), address);
        assert!(hook.displaced_len() >= JMP_REL32_LEN);
        assert_ne!(hook.trampoline(), 0);

        // make sure the target now jumps away
        let first = unsafe { *(address as *const u8) };
        assert!(first == 0xe9 || first == 0xff);

        assert_eq!(call(page), 42);
        assert_eq!(call(page), 42);
    }

    #[test]
    /// A handler sees the state produced by the code before the hook
    fn test_read_register() {
        let page = code_page(&FUNCTION);
        unsafe {
            MidHook::install(start(page) + 5, Box::new(|registers: &mut Registers| registers.rax += 1))
                .unwrap();
        }
        assert_eq!(call(page), 8);
    }

    #[test]
    /// Displaced instructions still run after the handler
    fn test_displaced_instruction_runs() {
        let page = code_page(&FUNCTION);
        unsafe {
            // `mov eax, 7` is moved into the trampoline and overrides the handler
            MidHook::install(start(page), Box::new(|registers: &mut Registers| registers.rax = 42)).unwrap();
        }
        assert_eq!(call(page), 7);
    }

    #[test]
    /// Single precision lanes written by the handler reach the code after the hook
    fn test_xmm_round_trip() {
        let page = code_page(&IDENTITY);
        assert_eq!(call_f32(page, 2.0), 2.0);

        unsafe {
            MidHook::install(
                start(page),
                Box::new(|registers: &mut Registers| {
                    let xmm0 = &mut registers.xmm[0];
                    xmm0.set_f32(0, xmm0.f32(0) * 2.5);
                }),
            )
            .unwrap();
        }
        assert_eq!(call_f32(page, 2.0), 5.0);
    }

    #[test]
    /// A displaced RIP-relative store still writes to its original target
    fn test_rip_relative_store() {
        let page = code_page(&STORE);
        let stored = (start(page) + STORED) as *const f32;
        call_f32(page, 1.0);
        assert_eq!(unsafe { *stored }, 1.0);

        unsafe {
            MidHook::install(
                start(page),
                Box::new(|registers: &mut Registers| registers.xmm[0].set_f32(0, 106.5)),
            )
            .unwrap();
        }
        assert_eq!(call_f32(page, 90.0), 106.5);
        assert_eq!(unsafe { *stored }, 106.5);
    }

    #[test]
    /// A panicking handler does not take the host down
    fn test_handler_panic() {
        let page = code_page(&FUNCTION);
        unsafe {
            MidHook::install(
                start(page) + 5,
                Box::new(|registers: &mut Registers| {
                    registers.rax = 9;
                    panic!("handler failure");
                }),
            )
            .unwrap();
        }
        assert_eq!(call(page), 9);
    }

    #[test]
    fn test_already_hooked() {
        let page = code_page(&FUNCTION);
        let address = start(page) + 5;
        unsafe {
            MidHook::install(address, Box::new(|_: &mut Registers| {})).unwrap();
            let error = MidHook::install(address, Box::new(|_: &mut Registers| {})).err().unwrap();
            assert!(matches!(error, HookError::AlreadyHooked { .. }));

            // inside the displaced bytes of the first hook
            let error = MidHook::install(address + 2, Box::new(|_: &mut Registers| {})).err().unwrap();
            assert!(matches!(error, HookError::AlreadyHooked { .. }));
        }
    }

    #[test]
    /// Once the jump is overwritten the site can be hooked again
    fn test_rewritten_site() {
        let page = code_page(&FUNCTION);
        let address = start(page) + 5;
        unsafe {
            MidHook::install(address, Box::new(|registers: &mut Registers| registers.rax = 1)).unwrap();
            assert_eq!(call(page), 1);

            // the host restores its original code
            slice::from_raw_parts_mut(address as *mut u8, FUNCTION.len() - 5).copy_from_slice(&FUNCTION[5..]);
            assert_eq!(call(page), 7);

            MidHook::install(address, Box::new(|registers: &mut Registers| registers.rax = 2)).unwrap();
        }
        assert_eq!(call(page), 2);
    }

    #[test]
    fn test_not_executable() {
        let mut page = region::alloc(region::page::size(), Protection::READ_WRITE).unwrap();
        let address = page.as_mut_ptr::<u8>() as usize;
        let error = unsafe { MidHook::install(address, Box::new(|_: &mut Registers| {})) }
            .err()
            .unwrap();
        assert!(matches!(error, HookError::NotExecutable { .. }));
    }

    #[test]
    fn test_decode_displaced() {
        let instructions = decode_displaced(0x1000, JMP_REL32_LEN, &FUNCTION).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].len(), 5);

        let instructions = decode_displaced(0x1000, JMP_ABS_LEN, &FUNCTION).unwrap();
        assert_eq!(instructions.iter().map(Instruction::len).sum::<usize>(), 14);

        // runs out of bytes halfway through `mov`
        assert!(matches!(
            decode_displaced(0x1000, JMP_REL32_LEN, &FUNCTION[..3]),
            Err(HookError::Decode { address: 0x1000 })
        ));

        // `ret` before the jump fits
        assert!(matches!(
            decode_displaced(0x1000, JMP_REL32_LEN, &[0x90, 0xc3, 0x90, 0x90, 0x90, 0x90]),
            Err(HookError::TooShort { address: 0x1000 })
        ));
    }
}
