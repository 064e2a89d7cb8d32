//! This module contains a patcher which adjusts memory permissions to patch read-only data

use std::convert::Infallible;

use region::Protection;
use thiserror::Error;

use super::Patcher;

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}
impl From<Infallible> for PermissionError<Infallible> {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// The pages stay executable while they are writable, since code on the same page may be running on another thread.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        if patch.is_empty() {
            return Ok(());
        }
        // the previous protection comes back when the handle drops
        let _guard =
            region::protect_with_handle(location, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        self.patcher.patch(location, patch).map_err(Into::into)
    }
}
