//! # Fix
//!
//! Fixes are data: a list of hook sites and patch sites plus an enable flag. [`FixOrchestrator`] walks
//! each site through its [`SiteState`] machine against a [`Backend`], which owns the actual scanning,
//! hooking and patching.

use std::fmt::{self, Display};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::code::x64::JMP_REL32_LEN;
use crate::error::FixError;
use crate::hook::{Gpr, Handler, HookError, MidHook, Registers};
use crate::patcher::{hex_bytes, PatchWriter};
use crate::scanner::{ImageScanner, ScanMatch};
use crate::signature::ByteSignature;

pub mod fov;
pub mod resolution;

/// Where a single site is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    /// The owning fix is turned off; terminal
    Disabled,
    /// The owning fix is on, nothing done yet
    Enabled,
    /// Looking for the site in the image
    Scanning,
    /// The site's address is known
    Found,
    /// The signature did not resolve to an address
    NotFound,
    /// Hook installed or bytes written; terminal
    Applied,
    /// Left unmodified; terminal
    Skipped,
}

/// A transition [`SiteState::advance`] refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid site transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// State before
    pub from: SiteState,
    /// Requested state
    pub to: SiteState,
}

impl SiteState {
    /// Moves to `next` if the lifecycle allows it
    ///
    /// Sites at fixed offsets skip [`SiteState::Scanning`] and go straight from enabled to found. Sites of a
    /// fix abandoned before it ran go straight from enabled to skipped.
    pub fn advance(self, next: SiteState) -> Result<SiteState, InvalidTransition> {
        use SiteState::*;
        match (self, next) {
            (Enabled, Scanning)
            | (Enabled, Found)
            | (Enabled, Skipped)
            | (Scanning, Found)
            | (Scanning, NotFound)
            | (Found, Applied)
            | (Found, Skipped)
            | (NotFound, Skipped) => Ok(next),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }

    /// True once nothing further can happen to the site
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disabled | Self::Applied | Self::Skipped)
    }
}

/// What a hook does to the registers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookAction {
    /// Overwrite a general purpose register
    SetRegister {
        /// Register to overwrite
        register: Gpr,
        /// New value
        value: u64,
    },
    /// Replace the single precision FOV in `xmm0` with its corrected value
    CorrectFov {
        /// Configured FOV in degrees
        configured: f32,
        /// Target aspect ratio
        aspect_ratio: f32,
    },
}

impl HookAction {
    /// Applies the action to a register file
    pub fn apply(self, registers: &mut Registers) {
        match self {
            Self::SetRegister { register, value } => *registers.gpr_mut(register) = value,
            Self::CorrectFov {
                configured,
                aspect_ratio,
            } => {
                let xmm0 = &mut registers.xmm[0];
                xmm0.set_f32(0, fov::corrected_fov(xmm0.f32(0), configured, aspect_ratio));
            }
        }
    }

    /// A hook handler performing this action. All values are captured by copy.
    pub fn handler(self) -> Handler {
        Box::new(move |registers: &mut Registers| self.apply(registers))
    }
}

/// An instruction to intercept, located by signature
#[derive(Debug, Clone, PartialEq)]
pub struct HookSite {
    /// Name used in log lines
    pub name: String,
    /// Pattern text
    pub signature: String,
    /// Distance from the start of the match to the hooked instruction
    pub offset: usize,
    /// What the hook does
    pub action: HookAction,
}

/// Static data to overwrite at fixed offsets from the module base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    /// Name used in log lines
    pub name: String,
    /// Offsets from the module base, each receiving the same payload
    pub offsets: Vec<usize>,
    /// Bytes to write
    pub payload: Vec<u8>,
}

/// One logical fix
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    /// Name used in log lines
    pub name: &'static str,
    /// Whether the fix runs at all
    pub enabled: bool,
    /// Intercepts, installed in order
    pub hooks: Vec<HookSite>,
    /// Static writes, performed after the hooks
    pub patches: Vec<PatchSite>,
}

impl Fix {
    /// Pattern of the first hook site, if the fix is enabled
    pub fn probe_signature(&self) -> Option<&str> {
        self.hooks
            .first()
            .filter(|_| self.enabled)
            .map(|site| site.signature.as_str())
    }

    /// Names of the hook sites, then of the patch sites
    pub fn site_names(&self) -> impl Iterator<Item = &str> {
        self.hooks
            .iter()
            .map(|site| site.name.as_str())
            .chain(self.patches.iter().map(|site| site.name.as_str()))
    }

    /// Parses every hook signature, or returns the index and error of the first malformed one
    fn parse_signatures(&self) -> Result<Vec<ByteSignature>, (usize, FixError)> {
        self.hooks
            .iter()
            .enumerate()
            .map(|(index, site)| ByteSignature::parse(&site.signature).map_err(|e| (index, e.into())))
            .collect()
    }
}

/// Access to the host image used by the orchestrator
pub trait Backend {
    /// Load base of the image
    fn base(&self) -> usize;

    /// Resolves `signature` to one match
    fn find(&mut self, signature: &ByteSignature) -> Result<ScanMatch, FixError>;

    /// Installs `handler` at `address` for the rest of the process lifetime
    fn install_hook(&mut self, address: usize, handler: Handler) -> Result<(), FixError>;

    /// Writes `payload` at `address`
    fn write_patch(&mut self, address: usize, payload: &[u8]) -> Result<(), FixError>;
}

/// Backend operating on the live host image
pub struct LiveBackend {
    /// Scanner over the host image
    scanner: ImageScanner,
    /// Writer restricted to the host image
    writer: PatchWriter,
    /// Every hook installed so far
    hooks: Vec<&'static MidHook>,
}

impl LiveBackend {
    /// Creates a backend over the image `scanner` covers
    pub fn new(scanner: ImageScanner) -> Self {
        Self {
            writer: PatchWriter::new(*scanner.region()),
            scanner,
            hooks: Vec::new(),
        }
    }

    /// Hooks installed through this backend
    pub fn hooks(&self) -> &[&'static MidHook] {
        &self.hooks
    }
}

impl Backend for LiveBackend {
    fn base(&self) -> usize {
        self.scanner.region().base()
    }

    fn find(&mut self, signature: &ByteSignature) -> Result<ScanMatch, FixError> {
        self.scanner.find(signature)
    }

    fn install_hook(&mut self, address: usize, handler: Handler) -> Result<(), FixError> {
        if !self.scanner.region().contains(address, JMP_REL32_LEN) {
            return Err(HookError::OutsideImage { address }.into());
        }
        // Safety: the address lies inside the host image, at a signature match plus the offset its site
        // gives for the start of the hooked instruction
        let hook = unsafe { MidHook::install(address, handler)? };
        debug!("Trampoline for 0x{:x} @ 0x{:x}", address, hook.trampoline());
        self.hooks.push(hook);
        Ok(())
    }

    fn write_patch(&mut self, address: usize, payload: &[u8]) -> Result<(), FixError> {
        Ok(self.writer.write(address, payload)?)
    }
}

/// Final state of one site
#[derive(Debug)]
pub struct SiteReport {
    /// Site name
    pub name: String,
    /// Terminal state
    pub state: SiteState,
    /// Every failure met on the way, in order
    pub errors: Vec<FixError>,
}

impl SiteReport {
    /// Starts a report in `state`
    fn new(name: &str, state: SiteState) -> Self {
        Self {
            name: name.to_string(),
            state,
            errors: Vec::new(),
        }
    }

    /// Advances the site, logging instead of failing on an impossible transition
    fn advance(&mut self, next: SiteState) {
        match self.state.advance(next) {
            Ok(state) => self.state = state,
            Err(e) => error!("{}: {}", self.name, e),
        }
    }
}

/// Summary of one fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    /// The fix was turned off
    Disabled,
    /// At least one site applied
    Applied,
    /// Nothing applied
    Skipped,
}

impl Display for FixOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
        })
    }
}

/// Per-site outcomes of one fix
#[derive(Debug)]
pub struct FixReport {
    /// Fix name
    pub fix: &'static str,
    /// One entry per hook site, then one per patch site
    pub sites: Vec<SiteReport>,
}

impl FixReport {
    /// Summarises the sites
    pub fn outcome(&self) -> FixOutcome {
        if self.sites.iter().all(|site| site.state == SiteState::Disabled) {
            FixOutcome::Disabled
        } else if self.sites.iter().any(|site| site.state == SiteState::Applied) {
            FixOutcome::Applied
        } else {
            FixOutcome::Skipped
        }
    }
}

/// Applies fixes through a backend
pub struct FixOrchestrator<B> {
    /// Image access
    backend: B,
}

impl<B: Backend> FixOrchestrator<B> {
    /// Creates an orchestrator over `backend`
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Consumes the orchestrator and returns the backend
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Runs every site of `fix`. Failures only skip the failing site, except for a malformed signature,
    /// which skips the whole fix before anything is scanned.
    pub fn run(&mut self, fix: &Fix) -> FixReport {
        info!("{} fix {}", fix.name, if fix.enabled { "Enabled" } else { "Disabled" });

        let sites = if !fix.enabled {
            fix.site_names()
                .map(|name| SiteReport::new(name, SiteState::Disabled))
                .collect()
        } else {
            match fix.parse_signatures() {
                Ok(signatures) => self.apply(fix, &signatures),
                Err((index, e)) => abandon(fix, index, e),
            }
        };

        let report = FixReport {
            fix: fix.name,
            sites,
        };
        if fix.enabled {
            info!("{} fix {}", fix.name, report.outcome());
        }
        report
    }

    /// Hooks, then patches, every site of an enabled fix
    fn apply(&mut self, fix: &Fix, signatures: &[ByteSignature]) -> Vec<SiteReport> {
        let mut sites = Vec::with_capacity(fix.hooks.len() + fix.patches.len());
        for (site, signature) in fix.hooks.iter().zip(signatures) {
            let mut report = SiteReport::new(&site.name, SiteState::Enabled);
            self.hook_site(site, signature, &mut report);
            sites.push(report);
        }
        for site in &fix.patches {
            let mut report = SiteReport::new(&site.name, SiteState::Enabled);
            self.patch_site(site, &mut report);
            sites.push(report);
        }
        sites
    }

    /// Scans for a hook site and installs its hook
    fn hook_site(&mut self, site: &HookSite, signature: &ByteSignature, report: &mut SiteReport) {
        report.advance(SiteState::Scanning);
        let found = match self.backend.find(signature) {
            Ok(found) => found,
            Err(e) => {
                match &e {
                    FixError::ScanMiss { .. } => info!("{}", e),
                    _ => warn!("{}: {}", site.name, e),
                }
                report.advance(SiteState::NotFound);
                report.advance(SiteState::Skipped);
                report.errors.push(e);
                return;
            }
        };
        info!("Found '{}' @ 0x{:x}", site.signature, found.offset());
        report.advance(SiteState::Found);

        let address = found.address + site.offset;
        match self.backend.install_hook(address, site.action.handler()) {
            Ok(()) => {
                info!(
                    "Hooked @ 0x{:x} + 0x{:x} = 0x{:x}",
                    found.offset(),
                    site.offset,
                    found.offset() + site.offset
                );
                report.advance(SiteState::Applied);
            }
            Err(e) => {
                warn!("{}: {}", site.name, e);
                report.advance(SiteState::Skipped);
                report.errors.push(e);
            }
        }
    }

    /// Writes a patch site's payload at each of its offsets
    fn patch_site(&mut self, site: &PatchSite, report: &mut SiteReport) {
        report.advance(SiteState::Found);

        let payload = hex_bytes(&site.payload);
        let mut written = 0;
        for &offset in &site.offsets {
            let address = self.backend.base() + offset;
            match self.backend.write_patch(address, &site.payload) {
                Ok(()) => {
                    info!("Patched '{}' @ 0x{:x}", payload, address);
                    written += 1;
                }
                Err(e) => {
                    warn!("{}: {}", site.name, e);
                    report.errors.push(e);
                }
            }
        }

        report.advance(if written > 0 {
            SiteState::Applied
        } else {
            SiteState::Skipped
        });
    }
}

/// Skips every site of `fix` because the hook site at `failed` has a malformed signature
fn abandon(fix: &Fix, failed: usize, error: FixError) -> Vec<SiteReport> {
    error!("{}: {}, not applying the {} fix", fix.hooks[failed].name, error, fix.name);
    let mut sites: Vec<_> = fix
        .site_names()
        .map(|name| {
            let mut report = SiteReport::new(name, SiteState::Enabled);
            report.advance(SiteState::Skipped);
            report
        })
        .collect();
    sites[failed].errors.push(error);
    sites
}
