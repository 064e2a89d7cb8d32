//! # Patcher
//!
//! This module covers patchers, which overwrite locations in memory.
//! Patches are one-shot: nothing here records or restores the bytes that were replaced.

use std::convert::Infallible;

use thiserror::Error;

use crate::scanner::ImageRegion;

use self::byte::BytePatcher;
use self::mem::{PermissionError, PermissionWrapper};

pub mod byte;
pub mod mem;

/// Writes a byte payload to a location
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` writes
/// exactly `patch.len()` bytes at `target` and nothing else
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`Infallible`].
    type Error;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but `target` must be valid
    /// for `patch.len()` bytes for the supplied patcher
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error>;
}

/// Errors from [`PatchWriter`]
#[derive(Debug, Error)]
pub enum PatchError {
    /// The write would touch bytes outside the module image
    #[error("Patch of {len} bytes @ 0x{address:x} lies outside the image")]
    OutsideImage {
        /// Start of the write
        address: usize,
        /// Length of the write
        len: usize,
    },
    /// Part of the range is not mapped
    #[error("Address 0x{address:x} is not mapped")]
    Unmapped {
        /// Start of the write
        address: usize,
    },
    /// Changing the page protection failed
    #[error("{0}")]
    Permission(#[from] PermissionError<Infallible>),
}

/// Writes static data into a module image, adjusting page protection around each write
pub struct PatchWriter {
    /// Image all writes must stay inside of
    image: ImageRegion,
    /// Underlying protection-aware patcher
    writer: PermissionWrapper<BytePatcher>,
}

impl PatchWriter {
    /// Creates a writer restricted to `image`
    pub fn new(image: ImageRegion) -> Self {
        Self {
            image,
            writer: PermissionWrapper::new(BytePatcher::new()),
        }
    }

    /// Copies `bytes` verbatim to `address`
    ///
    /// The pages are made writable for the duration of the copy and their previous protection is
    /// restored afterwards.
    pub fn write(&self, address: usize, bytes: &[u8]) -> Result<(), PatchError> {
        if !self.image.contains(address, bytes.len()) {
            return Err(PatchError::OutsideImage {
                address,
                len: bytes.len(),
            });
        }
        ensure_mapped(address, bytes.len())?;

        // Safety: the range is inside the image and mapped, and the wrapper makes it writable
        unsafe { self.writer.patch(address as *mut u8, bytes)? };
        Ok(())
    }

    /// Writes the same payload to every address; a failure at one address does not stop the others
    pub fn write_all(&self, addresses: &[usize], bytes: &[u8]) -> Vec<Result<(), PatchError>> {
        addresses
            .iter()
            .map(|&address| self.write(address, bytes))
            .collect()
    }
}

/// Checks that every byte of `address..address + len` belongs to a mapped region
fn ensure_mapped(address: usize, len: usize) -> Result<(), PatchError> {
    if len == 0 {
        return Ok(());
    }
    let unmapped = || PatchError::Unmapped { address };
    let regions =
        region::query_range(address as *const u8, len).map_err(|_| unmapped())?;

    let mut cursor = address;
    for region in regions {
        let range = region.map_err(|_| unmapped())?.as_range();
        if range.start > cursor {
            break;
        }
        cursor = cursor.max(range.end);
    }
    if cursor < address + len {
        return Err(unmapped());
    }
    Ok(())
}

/// Encodes a 32-bit integer the way the host stores it
pub fn le_i32(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Renders a payload the way it is written to the log, e.g. `70 0D 00 00`
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
