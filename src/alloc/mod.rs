//! Allocates buffers near a given address
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;

use self::proximity::{Allocation, ProximityAllocator, ProximityError};

pub mod proximity;
pub mod search;

/// A thread-safe memory pool for allocating chunks close to addresses.
pub struct NearAllocator(Mutex<ProximityAllocator>);

impl NearAllocator {
    /// Creates a new proximity memory allocator.
    pub fn new(max_distance: usize) -> Self {
        NearAllocator(Mutex::new(ProximityAllocator::new(max_distance)))
    }

    /// Allocates read-, write- & executable memory close to `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
        // a poisoned pool is still consistent, allocation never panics halfway
        let mut allocator = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        allocator
            .allocate(origin, size)
            .map(|data| ExecutableMemory { data })
    }
}

/// A handle for allocated proximity memory.
///
/// The chunk goes back to its pool on drop. Pools themselves are never unmapped.
pub struct ExecutableMemory {
    /// Actual allocation where the executable code resides
    data: Allocation,
}

impl ExecutableMemory {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data.deref()
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.deref_mut()
    }
}

/// How far a trampoline may be from its hook site and still be reached with `jmp rel32`.
///
/// Slightly under 2 GiB so that any byte of a page sized pool stays in range.
pub const REL32_RANGE: usize = 0x7ff0_0000;

lazy_static! {
    static ref POOL: NearAllocator = NearAllocator::new(REL32_RANGE);
}

/// Allocates an executable buffer near `origin`
///
/// Note: When the executable buffer returns, the buffer's data is undefined, but valid u8 values
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, ProximityError> {
    POOL.allocate(origin, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_executable() {
        let anchor = region::alloc(region::page::size(), region::Protection::READ).unwrap();
        let origin = anchor.as_ptr::<u8>() as usize;

        let mut memory = allocate_executable(origin, 64).unwrap();
        assert_eq!(memory.len(), 64);
        assert!(memory.address().abs_diff(origin) < REL32_RANGE);

        // the buffer is writable
        memory[..2].copy_from_slice(&[0x90, 0xc3]);
        assert_eq!(&memory[..2], &[0x90, 0xc3]);
    }
}
