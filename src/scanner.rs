//! # Scanner
//!
//! Walks a module's in-memory image looking for [`ByteSignature`] matches

use std::ops::Range;
use std::slice;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::FixError;
use crate::signature::ByteSignature;

/// Address range of a loaded module image
///
/// The image is owned by the process; the scanner only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRegion {
    /// Load base of the module
    base: usize,
    /// Size of the image in bytes
    len: usize,
}

impl ImageRegion {
    /// Creates a region covering `len` bytes at `base`
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay mapped for as long as the region is scanned or patched.
    /// Pages inside the range that are not readable are skipped by the scanner.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Load base of the image
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the image in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero sized image
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the image
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.len)
    }

    /// Returns true if `address..address + len` lies entirely inside the image
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.end())
    }

    /// Splits the image into maximal runs of committed, readable, unguarded pages
    pub fn readable_runs(&self) -> Vec<Range<usize>> {
        let mut runs: Vec<Range<usize>> = Vec::new();
        if self.is_empty() {
            return runs;
        }

        let regions = match region::query_range(self.base as *const u8, self.len) {
            Ok(regions) => regions,
            Err(e) => {
                warn!("Unable to query image @ 0x{:x}: {}", self.base, e);
                return runs;
            }
        };

        for region in regions {
            let region = match region {
                Ok(region) => region,
                Err(e) => {
                    debug!("Skipping unqueryable memory: {}", e);
                    continue;
                }
            };
            if region.is_guarded() || !region.protection().contains(region::Protection::READ) {
                continue;
            }

            // clamp to the image
            let range = region.as_range();
            let start = range.start.max(self.base);
            let end = range.end.min(self.end());
            if start >= end {
                continue;
            }

            match runs.last_mut() {
                Some(last) if last.end == start => last.end = end,
                _ => runs.push(start..end),
            }
        }
        runs
    }
}

/// A signature hit inside an [`ImageRegion`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanMatch {
    /// Absolute address of the first byte of the match
    pub address: usize,
    /// Base of the image the match was found in
    pub base: usize,
}

impl ScanMatch {
    /// Offset of the match relative to the image base
    pub fn offset(&self) -> usize {
        self.address - self.base
    }
}

/// Which match to use when a signature hits more than once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Use the lowest address, warning about the others
    #[default]
    First,
    /// Refuse to pick; more than one hit skips the fix
    Unique,
}

/// Finds every start offset in `data` where `signature` matches, in ascending order
///
/// Never reads past the end of `data`. Overlapping matches are all reported.
pub fn scan_slice(data: &[u8], signature: &ByteSignature) -> Vec<usize> {
    let len = signature.len();
    if data.len() < len {
        return Vec::new();
    }

    let (anchor_index, anchor_byte) = signature.anchor();
    let last_start = data.len() - len;
    // position `i` of the haystack is the anchor of a match starting at `i`
    let haystack = &data[anchor_index..=last_start + anchor_index];

    memchr::memchr_iter(anchor_byte, haystack)
        .filter(|&start| signature.matches_at(&data[start..start + len]))
        .collect()
}

/// Scans the readable parts of `region` for `signature`
pub fn scan(region: &ImageRegion, signature: &ByteSignature) -> Vec<ScanMatch> {
    region
        .readable_runs()
        .into_iter()
        .flat_map(|run| {
            // Safety: `readable_runs` only yields committed readable memory inside the image,
            // and the caller of `ImageRegion::new` guaranteed the image stays mapped
            let data = unsafe { slice::from_raw_parts(run.start as *const u8, run.len()) };
            scan_slice(data, signature)
                .into_iter()
                .map(move |offset| ScanMatch {
                    address: run.start + offset,
                    base: region.base(),
                })
        })
        .collect()
}

/// Picks one match according to `policy`
pub fn resolve(
    signature: &ByteSignature,
    matches: &[ScanMatch],
    policy: MatchPolicy,
) -> Result<ScanMatch, FixError> {
    let first = match matches.first() {
        Some(first) => *first,
        None => {
            return Err(FixError::ScanMiss {
                pattern: signature.to_string(),
            })
        }
    };
    if matches.len() == 1 {
        return Ok(first);
    }

    let offsets = matches
        .iter()
        .map(|m| format!("0x{:x}", m.offset()))
        .collect::<Vec<_>>()
        .join(", ");
    match policy {
        MatchPolicy::First => {
            warn!(
                "'{}' matched {} times ({}), using 0x{:x}",
                signature,
                matches.len(),
                offsets,
                first.offset()
            );
            Ok(first)
        }
        MatchPolicy::Unique => {
            warn!("'{}' matched {} times ({})", signature, matches.len(), offsets);
            Err(FixError::ScanAmbiguous {
                pattern: signature.to_string(),
                count: matches.len(),
            })
        }
    }
}

/// Scanner bound to one image and one ambiguity policy
#[derive(Debug, Clone, Copy)]
pub struct ImageScanner {
    /// Image being scanned
    region: ImageRegion,
    /// Policy used by [`ImageScanner::find`]
    policy: MatchPolicy,
}

impl ImageScanner {
    /// Creates a scanner over `region`
    pub fn new(region: ImageRegion, policy: MatchPolicy) -> Self {
        Self { region, policy }
    }

    /// The scanned image
    pub fn region(&self) -> &ImageRegion {
        &self.region
    }

    /// Every match of `signature`, ascending
    pub fn scan(&self, signature: &ByteSignature) -> Vec<ScanMatch> {
        scan(&self.region, signature)
    }

    /// The single match selected by the scanner's policy
    pub fn find(&self, signature: &ByteSignature) -> Result<ScanMatch, FixError> {
        resolve(signature, &self.scan(signature), self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a region over a test buffer
    fn region_of(data: &[u8]) -> ImageRegion {
        unsafe { ImageRegion::new(data.as_ptr() as usize, data.len()) }
    }

    #[test]
    /// An embedded copy is found at the right offset
    fn test_single_match() {
        let sig = ByteSignature::parse("44 8B ?? 41 8D").unwrap();
        let mut data = vec![0u8; 64];
        data[20..25].copy_from_slice(&[0x44, 0x8B, 0x7F, 0x41, 0x8D]);

        assert_eq!(scan_slice(&data, &sig), vec![20]);

        let region = region_of(&data);
        let matches = scan(&region, &sig);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].offset(), 20);
        assert_eq!(matches[0].address, data.as_ptr() as usize + 20);
    }

    #[test]
    fn test_no_match() {
        let sig = ByteSignature::parse("44 8B ?? 41 8D").unwrap();
        let data = vec![0x44u8; 64];
        assert!(scan_slice(&data, &sig).is_empty());
        assert!(scan(&region_of(&data), &sig).is_empty());
    }

    #[test]
    /// Two copies come back in ascending order
    fn test_two_matches_ascending() {
        let sig = ByteSignature::parse("FF 15 ?? ?? ?? ?? 44 8B").unwrap();
        let copy = [0xFF, 0x15, 1, 2, 3, 4, 0x44, 0x8B];
        let mut data = vec![0x90u8; 100];
        data[70..78].copy_from_slice(&copy);
        data[10..18].copy_from_slice(&copy);

        assert_eq!(scan_slice(&data, &sig), vec![10, 70]);
    }

    #[test]
    /// Wildcards accept every byte value, concrete bytes accept exactly one
    fn test_wildcard_and_mismatch() {
        let sig = ByteSignature::parse("AA ?? BB").unwrap();
        for value in 0..=255u8 {
            assert_eq!(scan_slice(&[0xAA, value, 0xBB], &sig), vec![0]);
        }
        assert!(scan_slice(&[0xAA, 0x00, 0xBC], &sig).is_empty());
        assert!(scan_slice(&[0xAB, 0x00, 0xBB], &sig).is_empty());
    }

    #[test]
    /// Matches touching either end of the buffer are found without reading past it
    fn test_bounds() {
        let sig = ByteSignature::parse("?? 01 02").unwrap();
        assert_eq!(scan_slice(&[9, 1, 2], &sig), vec![0]);
        assert_eq!(scan_slice(&[0, 0, 9, 1, 2], &sig), vec![2]);
        // anchor byte present but the pattern would run off the end
        assert!(scan_slice(&[0, 0, 0, 1], &sig).is_empty());
        assert!(scan_slice(&[1, 2], &sig).is_empty());
        assert!(scan_slice(&[], &sig).is_empty());
    }

    #[test]
    fn test_overlapping_matches() {
        let sig = ByteSignature::parse("AA AA").unwrap();
        assert_eq!(scan_slice(&[0xAA, 0xAA, 0xAA], &sig), vec![0, 1]);
    }

    #[test]
    /// Policies pick the first match or refuse ambiguity
    fn test_resolve_policies() {
        let sig = ByteSignature::parse("C3").unwrap();
        let hit = |address| ScanMatch { address, base: 0x1000 };

        assert!(matches!(
            resolve(&sig, &[], MatchPolicy::First),
            Err(FixError::ScanMiss { .. })
        ));
        assert_eq!(
            resolve(&sig, &[hit(0x1010)], MatchPolicy::Unique).unwrap(),
            hit(0x1010)
        );
        assert_eq!(
            resolve(&sig, &[hit(0x1010), hit(0x1020)], MatchPolicy::First).unwrap(),
            hit(0x1010)
        );
        assert!(matches!(
            resolve(&sig, &[hit(0x1010), hit(0x1020)], MatchPolicy::Unique),
            Err(FixError::ScanAmbiguous { count: 2, .. })
        ));
    }

    #[test]
    fn test_region_contains() {
        let region = unsafe { ImageRegion::new(0x1000, 0x100) };
        assert!(region.contains(0x1000, 4));
        assert!(region.contains(0x10FC, 4));
        assert!(!region.contains(0x10FD, 4));
        assert!(!region.contains(0xFFF, 4));
        assert!(!region.contains(usize::MAX, 4));
    }

    #[test]
    /// A heap buffer is one readable run
    fn test_readable_runs() {
        let data = vec![0u8; 4096];
        let region = region_of(&data);
        let start = data.as_ptr() as usize;
        assert_eq!(region.readable_runs(), vec![start..start + data.len()]);
    }
}
