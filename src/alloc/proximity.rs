//! Proximity allocator
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

use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};
use thiserror::Error;

use super::search::{self, Direction};

/// Defines the allocation type.
pub type Allocation = SliceBox<u8>;

/// Errors that occur while creating proximity allocations
#[derive(Debug, Error)]
pub enum ProximityError {
    /// Ran out of memory within an acceptable proximity to the allocation location
    #[error("Ran out of memory within an acceptable proximity to the allocation location")]
    OutOfMemory,
    /// Error while mapping a pool
    #[error("Error while mapping memory: {0}")]
    MmapError(#[from] mmap::MapError),
    /// Error while querying a memory region
    #[error("Error while querying memory: {0}")]
    RegionError(#[from] region::Error),
}

/// Page sized executable pools, each within `max_distance` of the origins they were created for
pub struct ProximityAllocator {
    /// Max distance away from the origin that the pool can be
    max_distance: usize,
    /// Memory pools used for allocations
    pools: Vec<SlicePool<u8>>,
}

impl ProximityAllocator {
    /// Creates an allocator with no pools
    pub fn new(max_distance: usize) -> Self {
        Self {
            max_distance,
            pools: Vec::new(),
        }
    }

    /// Allocates `size` read-, write- & executable bytes within `max_distance` of `origin`.
    ///
    /// Requests larger than a page cannot be served.
    pub fn allocate(&mut self, origin: usize, size: usize) -> Result<Allocation, ProximityError> {
        let page_size = region::page::size();
        if size == 0 || size > page_size {
            return Err(ProximityError::OutOfMemory);
        }

        let range =
            origin.saturating_sub(self.max_distance)..origin.saturating_add(self.max_distance);

        // Check if an existing pool can handle the allocation request
        if let Some(allocation) = self.allocate_existing(&range, size) {
            return Ok(allocation);
        }

        // ... otherwise map a new pool within the memory range
        let pool = Self::allocate_pool(&range, origin, page_size)?;
        let allocation = pool.alloc(size).ok_or(ProximityError::OutOfMemory)?;
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Number of pools mapped so far
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Allocates a chunk using any pool that lies entirely inside `range`.
    fn allocate_existing(&mut self, range: &Range<usize>, size: usize) -> Option<Allocation> {
        self.pools
            .iter_mut()
            .filter(|pool| {
                let lower = pool.as_ptr() as usize;
                let upper = lower + pool.len();
                range.contains(&lower) && range.contains(&(upper - 1))
            })
            .find_map(|pool| pool.alloc(size))
    }

    /// Maps a new page sized pool at the closest free page to `origin`.
    fn allocate_pool(
        range: &Range<usize>,
        origin: usize,
        page_size: usize,
    ) -> Result<SlicePool<u8>, ProximityError> {
        // Try after the origin first (mostly because macOS cannot allocate memory before the
        // process's address). Free pages whose pool would leave the range are skipped.
        let fits = |address: &usize| range.contains(&(address + page_size - 1));
        let after = search::free_pages(origin, range.clone(), Direction::After);
        let before = search::free_pages(origin, range.clone(), Direction::Before);

        after
            .chain(before)
            .filter(|result| result.as_ref().map_or(true, fits))
            .find_map(|result| match result {
                // the page is known to be free, so a fixed mapping cannot clobber anything
                Ok(address) => Self::map_fixed(address, page_size).ok().map(Ok),
                Err(error) => Some(Err(ProximityError::RegionError(error))),
            })
            .unwrap_or(Err(ProximityError::OutOfMemory))
    }

    /// Tries to map `size` RWX bytes at exactly `address`.
    fn map_fixed(address: usize, size: usize) -> Result<SlicePool<u8>, ProximityError> {
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const u8),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => ProximityError::OutOfMemory,
            e => ProximityError::MmapError(e),
        })
        .map(PoolMemory)
        .map(SlicePool::new)
    }
}

/// A memory map usable as the backing store of a `SlicePool`.
struct PoolMemory(mmap::MemoryMap);

impl AsRef<[u8]> for PoolMemory {
    fn as_ref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }
}

impl AsMut<[u8]> for PoolMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

// the map is only reached through the pool, which synchronizes access
unsafe impl Send for PoolMemory {}
unsafe impl Sync for PoolMemory {}

#[cfg(test)]
mod tests {
    use region::Protection;

    use super::*;

    #[test]
    /// Allocations land within range of the origin and share a pool
    fn test_allocate_near() {
        let anchor = region::alloc(region::page::size(), Protection::READ).unwrap();
        let origin = anchor.as_ptr::<u8>() as usize;
        let max_distance = 0x7ff0_0000;
        let mut allocator = ProximityAllocator::new(max_distance);

        let first = allocator.allocate(origin, 256).unwrap();
        let second = allocator.allocate(origin, 256).unwrap();
        assert_eq!(allocator.pool_count(), 1);

        for allocation in [&first, &second] {
            let address = allocation.as_ptr() as usize;
            assert!(address.abs_diff(origin) < max_distance);
            assert_eq!(allocation.len(), 256);
        }
        assert_ne!(first.as_ptr(), second.as_ptr());

        let protection = region::query(first.as_ptr()).unwrap().protection();
        assert_eq!(protection, Protection::READ_WRITE_EXECUTE);
    }

    #[test]
    fn test_rejects_oversized() {
        let mut allocator = ProximityAllocator::new(0x7ff0_0000);
        assert!(matches!(
            allocator.allocate(0x1000_0000, region::page::size() + 1),
            Err(ProximityError::OutOfMemory)
        ));
        assert!(matches!(
            allocator.allocate(0x1000_0000, 0),
            Err(ProximityError::OutOfMemory)
        ));
    }
}
