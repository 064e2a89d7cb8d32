//! x86-64 code generation for hooks

use iced_x86::code_asm::*;
use iced_x86::{IcedError, Instruction};

use crate::hook::context::{RED_ZONE, XMM_AREA};

/// Length of `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;
/// Length of `jmp [rip + 0]; dq target`
pub const JMP_ABS_LEN: usize = 14;
/// Single byte `nop`
pub const NOP: u8 = 0x90;

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; JMP_ABS_LEN] {
    let mut code = [0u8; JMP_ABS_LEN];
    // jmp qword ptr [rip + 0]
    code[..6].copy_from_slice(&[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&(target as u64).to_le_bytes());
    code
}

/// Generates a `jmp rel32` located at `source` to `target`, or `None` if the distance does not fit in 32 bits
pub fn jmp_rel32(source: usize, target: usize) -> Option<[u8; JMP_REL32_LEN]> {
    let next = (source as i128) + JMP_REL32_LEN as i128;
    let displacement = i32::try_from(target as i128 - next).ok()?;
    let mut code = [0u8; JMP_REL32_LEN];
    code[0] = 0xe9;
    code[1..].copy_from_slice(&displacement.to_le_bytes());
    Some(code)
}

/// Builds the hook jump for `source`, padded with `nop`s to `len` bytes
///
/// Uses `jmp rel32` when `target` is in range and `len` allows it, an absolute jump otherwise.
/// Returns `None` if neither form fits in `len`.
pub fn hook_jump(source: usize, target: usize, len: usize) -> Option<Vec<u8>> {
    let jump: Vec<u8> = match jmp_rel32(source, target) {
        Some(rel) if len >= JMP_REL32_LEN => rel.into(),
        _ if len >= JMP_ABS_LEN => jmp_abs(target).into(),
        _ => return None,
    };
    let mut code = vec![NOP; len];
    code[..jump.len()].copy_from_slice(&jump);
    Some(code)
}

/// General purpose registers in push order. Reversed, they are the `r15..rax` fields of `Registers`.
const PUSHED: [AsmRegister64; 15] = [
    rax, rcx, rdx, rbx, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

/// Vector registers in `Registers::xmm` order
const VECTORS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14,
    xmm15,
];

/// First integer argument register of the `extern "C"` ABI
#[cfg(windows)]
const ARG0: AsmRegister64 = rcx;
/// Second integer argument register of the `extern "C"` ABI
#[cfg(windows)]
const ARG1: AsmRegister64 = rdx;
#[cfg(not(windows))]
const ARG0: AsmRegister64 = rdi;
#[cfg(not(windows))]
const ARG1: AsmRegister64 = rsi;

/// Assembles a mid-hook trampoline located at `ip`.
///
/// The trampoline saves the full register file onto the interrupted stack in the layout of
/// `hook::Registers`, calls `dispatch(registers, data)` with a 16 byte aligned stack and shadow space,
/// restores every register (including any changes made through `registers`), runs `displaced` and
/// finally jumps to `resume`.
///
/// `displaced` instructions keep their original addresses; the block encoder rewrites relative branches and
/// RIP-relative operands for the new location.
pub fn mid_hook_stub(
    ip: u64,
    dispatch: u64,
    data: u64,
    displaced: &[Instruction],
    resume: u64,
) -> Result<Vec<u8>, IcedError> {
    let mut a = CodeAssembler::new(64)?;

    // leaf code may keep live data below rsp
    a.lea(rsp, ptr(rsp - RED_ZONE as i32))?;
    a.pushfq()?;
    for reg in PUSHED {
        a.push(reg)?;
    }
    a.sub(rsp, XMM_AREA as i32)?;
    for (i, xmm) in VECTORS.into_iter().enumerate() {
        a.movdqu(xmmword_ptr(rsp + (i * 16) as i32), xmm)?;
    }

    // rbx is callee-saved and already stored, so it can hold the frame across the call
    a.mov(rbx, rsp)?;
    a.mov(ARG0, rsp)?;
    a.mov(ARG1, data)?;
    a.and(rsp, -16)?;
    a.sub(rsp, 0x20)?;
    a.mov(rax, dispatch)?;
    a.call(rax)?;
    a.mov(rsp, rbx)?;

    for (i, xmm) in VECTORS.into_iter().enumerate() {
        a.movdqu(xmm, xmmword_ptr(rsp + (i * 16) as i32))?;
    }
    a.add(rsp, XMM_AREA as i32)?;
    for reg in PUSHED.into_iter().rev() {
        a.pop(reg)?;
    }
    // popfq restores whatever `add` did to the flags; lea leaves them alone
    a.popfq()?;
    a.lea(rsp, ptr(rsp + RED_ZONE as i32))?;

    for instruction in displaced {
        a.add_instruction(*instruction)?;
    }
    a.jmp(resume)?;

    a.assemble(ip)
}
