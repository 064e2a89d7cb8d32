//! This module contains the byte patchers

use std::convert::Infallible;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Patcher;

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        // Safety: caller must ensure that `location` is valid and writable for the full length of the patch
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());
        Ok(())
    }
}

/// Patcher for live code.
///
/// When the patch fits inside one naturally aligned qword, the whole qword is replaced with a single
/// atomic store, so a thread fetching instructions from it sees either the old bytes or the new ones.
/// Larger or straddling patches fall back to a plain copy.
#[derive(Default)]
pub struct AtomicPatcher;
impl AtomicPatcher {
    /// Creates a new [`AtomicPatcher`]
    pub fn new() -> Self {
        Self
    }

    /// Returns true if `len` bytes at `address` can be written with one store
    pub fn is_atomic(address: usize, len: usize) -> bool {
        (address & 7) + len <= 8
    }
}
unsafe impl Patcher for AtomicPatcher {
    type Error = Infallible;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        let address = location as usize;
        if patch.is_empty() || !Self::is_atomic(address, patch.len()) {
            ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());
            return Ok(());
        }

        let shift = address & 7;
        // Safety: an aligned qword never crosses a page, so it is as accessible as `location` itself
        let word = &*((address - shift) as *const AtomicU64);
        let mut bytes = word.load(Ordering::SeqCst).to_ne_bytes();
        bytes[shift..shift + patch.len()].copy_from_slice(patch);
        word.store(u64::from_ne_bytes(bytes), Ordering::SeqCst);
        Ok(())
    }
}
