//! # Error
//!
//! Failure taxonomy for a single fix site. None of these are fatal to the host;
//! every variant means "this site is not applied" and is logged.

use thiserror::Error;

use crate::hook::HookError;
use crate::patcher::PatchError;
use crate::signature::SignatureError;

/// Why a fix site was not applied
#[derive(Debug, Error)]
pub enum FixError {
    /// The site's signature could not be parsed
    #[error("Malformed signature: {0}")]
    Parse(#[from] SignatureError),
    /// The signature does not occur in the image
    #[error("Did not find '{pattern}'")]
    ScanMiss {
        /// Canonical pattern text
        pattern: String,
    },
    /// The signature occurs more than once and the policy refused to pick
    #[error("'{pattern}' is ambiguous ({count} matches)")]
    ScanAmbiguous {
        /// Canonical pattern text
        pattern: String,
        /// Number of matches found
        count: usize,
    },
    /// The intercept could not be installed
    #[error("Hook install failed: {0}")]
    HookInstall(#[from] HookError),
    /// The static data write failed
    #[error("Patch write failed: {0}")]
    PatchWrite(#[from] PatchError),
}
