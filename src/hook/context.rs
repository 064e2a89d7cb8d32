//! Register file handed to mid-hook handlers

use std::fmt::{self, Display};
use std::mem;

use serde::Deserialize;

/// Bytes skipped below the interrupted stack pointer before anything is saved
pub const RED_ZONE: usize = 128;

/// One 128-bit vector register
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Xmm(pub [u8; 16]);

impl Xmm {
    /// Reads 4 bytes at `lane * 4`
    fn lane4(&self, lane: usize) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[lane * 4..lane * 4 + 4]);
        bytes
    }

    /// Reads 8 bytes at `lane * 8`
    fn lane8(&self, lane: usize) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[lane * 8..lane * 8 + 8]);
        bytes
    }

    /// Single precision lane, `0..4`
    ///
    /// # Panics
    ///
    /// Panics if `lane` is out of range
    pub fn f32(&self, lane: usize) -> f32 {
        f32::from_ne_bytes(self.lane4(lane))
    }

    /// Overwrites a single precision lane, `0..4`
    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.0[lane * 4..lane * 4 + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Double precision lane, `0..2`
    pub fn f64(&self, lane: usize) -> f64 {
        f64::from_ne_bytes(self.lane8(lane))
    }

    /// Overwrites a double precision lane, `0..2`
    pub fn set_f64(&mut self, lane: usize, value: f64) {
        self.0[lane * 8..lane * 8 + 8].copy_from_slice(&value.to_ne_bytes());
    }

    /// 32-bit integer lane, `0..4`
    pub fn u32(&self, lane: usize) -> u32 {
        u32::from_ne_bytes(self.lane4(lane))
    }

    /// 64-bit integer lane, `0..2`
    pub fn u64(&self, lane: usize) -> u64 {
        u64::from_ne_bytes(self.lane8(lane))
    }

    /// Overwrites a 64-bit integer lane, `0..2`
    pub fn set_u64(&mut self, lane: usize, value: u64) {
        self.0[lane * 8..lane * 8 + 8].copy_from_slice(&value.to_ne_bytes());
    }
}

/// Register state of the interrupted thread, as saved by the hook trampoline.
///
/// The field order mirrors the trampoline's stack layout (lowest address first) and must not change
/// independently of `code::x64::mid_hook_stub`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct Registers {
    pub xmm: [Xmm; 16],
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub rflags: u64,
}

/// Bytes the trampoline reserves for the vector registers
pub const XMM_AREA: usize = mem::size_of::<[Xmm; 16]>();

impl Registers {
    /// Stack pointer of the interrupted thread at the hook site.
    ///
    /// Only meaningful for the `Registers` a handler receives, which live on the hooked thread's stack.
    /// Changing it is not supported.
    pub fn rsp(&self) -> u64 {
        self as *const Self as u64 + (mem::size_of::<Self>() + RED_ZONE) as u64
    }

    /// Value of a general purpose register
    pub fn gpr(&self, reg: Gpr) -> u64 {
        match reg {
            Gpr::Rax => self.rax,
            Gpr::Rbx => self.rbx,
            Gpr::Rcx => self.rcx,
            Gpr::Rdx => self.rdx,
            Gpr::Rsi => self.rsi,
            Gpr::Rdi => self.rdi,
            Gpr::Rbp => self.rbp,
            Gpr::R8 => self.r8,
            Gpr::R9 => self.r9,
            Gpr::R10 => self.r10,
            Gpr::R11 => self.r11,
            Gpr::R12 => self.r12,
            Gpr::R13 => self.r13,
            Gpr::R14 => self.r14,
            Gpr::R15 => self.r15,
        }
    }

    /// Mutable access to a general purpose register
    pub fn gpr_mut(&mut self, reg: Gpr) -> &mut u64 {
        match reg {
            Gpr::Rax => &mut self.rax,
            Gpr::Rbx => &mut self.rbx,
            Gpr::Rcx => &mut self.rcx,
            Gpr::Rdx => &mut self.rdx,
            Gpr::Rsi => &mut self.rsi,
            Gpr::Rdi => &mut self.rdi,
            Gpr::Rbp => &mut self.rbp,
            Gpr::R8 => &mut self.r8,
            Gpr::R9 => &mut self.r9,
            Gpr::R10 => &mut self.r10,
            Gpr::R11 => &mut self.r11,
            Gpr::R12 => &mut self.r12,
            Gpr::R13 => &mut self.r13,
            Gpr::R14 => &mut self.r14,
            Gpr::R15 => &mut self.r15,
        }
    }
}

/// A writable general purpose register. `rsp` is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Gpr {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rbx => "rbx",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::Rbp => "rbp",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}
