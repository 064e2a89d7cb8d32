//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another.
//! The only hook type is the mid-function hook in [`mid`], which hands the full register file of the
//! interrupted thread to a handler and then resumes the original code.

use std::convert::Infallible;

use iced_x86::IcedError;
use thiserror::Error;

use crate::alloc::proximity::ProximityError;
use crate::patcher::mem::PermissionError;

pub mod context;
pub mod mid;

pub use self::context::{Gpr, Registers, Xmm};
pub use self::mid::MidHook;

/// Code run every time a hooked instruction is reached.
///
/// Runs on whichever host thread hits the hook, so it must not block or take locks shared with the
/// installing thread.
pub type Handler = Box<dyn Fn(&mut Registers) + Send + Sync>;

/// Errors while installing a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// The target page cannot be executed
    #[error("0x{address:x} is not executable")]
    NotExecutable {
        /// Hook target
        address: usize,
    },
    /// The target lies outside the image being fixed
    #[error("0x{address:x} is outside the host image")]
    OutsideImage {
        /// Hook target
        address: usize,
    },
    /// Part of the range is already redirected by another hook
    #[error("0x{address:x} is already hooked")]
    AlreadyHooked {
        /// Hook target
        address: usize,
    },
    /// The target could not be queried, usually because it is not mapped
    #[error("Could not query 0x{address:x}: {source}")]
    Query {
        /// Hook target
        address: usize,
        /// Underlying error
        source: region::Error,
    },
    /// Bytes at the target are not valid instructions
    #[error("Could not decode an instruction at 0x{address:x}")]
    Decode {
        /// Address of the undecodable instruction
        address: usize,
    },
    /// The code at the target ends before a jump fits
    #[error("Code at 0x{address:x} ends before the hook jump fits")]
    TooShort {
        /// Hook target
        address: usize,
    },
    /// No executable memory could be found for the trampoline
    #[error("Could not allocate a trampoline: {0}")]
    Allocation(#[from] ProximityError),
    /// Fallback allocation failed
    #[error("Could not allocate a trampoline: {0}")]
    FarAllocation(#[source] region::Error),
    /// The trampoline could not be assembled
    #[error("Could not assemble the trampoline: {0}")]
    Assemble(#[from] IcedError),
    /// The assembled trampoline does not fit in its allocation
    #[error("Trampoline needs {needed} bytes, only {available} are available")]
    TrampolineTooSmall {
        /// Assembled size
        needed: usize,
        /// Allocated size
        available: usize,
    },
    /// The trampoline cannot be reached from the target with the displaced bytes
    #[error("Trampoline @ 0x{trampoline:x} is unreachable from 0x{address:x}")]
    Unreachable {
        /// Hook target
        address: usize,
        /// Trampoline address
        trampoline: usize,
    },
    /// The jump could not be written
    #[error("{0}")]
    Protection(#[from] PermissionError<Infallible>),
    /// Hooks are only implemented for x86-64
    #[error("Mid-function hooks require x86-64")]
    UnsupportedArchitecture,
}
