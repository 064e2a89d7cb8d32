//! Resolution override
//!
//! The host parses its resolution from strings. Two hooks replace the parsed width and height, and the
//! static copies the host keeps elsewhere in its image are patched to match.

use tracing::{debug, info};

use crate::hook::Gpr;
use crate::patcher::le_i32;
use crate::settings::Settings;

use super::{Fix, HookAction, HookSite, PatchSite};

/// Width conversion, hooked at the load of the parsed value
pub const WIDTH_PATTERN: &str = "44 8B ?? 41 8D ?? ?? 48 8B ?? ?? ?? FF 15 ?? ?? ?? ??";
/// Hook offset inside [`WIDTH_PATTERN`]
pub const WIDTH_HOOK_OFFSET: usize = 0;

/// Height conversion, hooked right after the conversion call returns
pub const HEIGHT_PATTERN: &str = "FF 15 ?? ?? ?? ?? 44 8B ?? 45 8B ??";
/// Hook offset inside [`HEIGHT_PATTERN`]
pub const HEIGHT_HOOK_OFFSET: usize = 6;

/// Offsets from the module base of the stored width
pub const WIDTH_OFFSETS: &[usize] = &[0x25E_50A0];
/// Offsets from the module base of the stored height
pub const HEIGHT_OFFSETS: &[usize] = &[0x25E_50A4];

/// The resolution fix for `settings`
pub fn fix(settings: &Settings) -> Fix {
    let (w, h) = settings.aspect_label();
    info!("Resolution: {}x{}", settings.width, settings.height);
    info!("Aspect Ratio: {}:{} {}", w, h, settings.aspect_ratio);

    let mut hooks = vec![
        HookSite {
            name: "width".into(),
            signature: WIDTH_PATTERN.into(),
            offset: WIDTH_HOOK_OFFSET,
            action: HookAction::SetRegister {
                register: Gpr::Rax,
                value: settings.width.into(),
            },
        },
        HookSite {
            name: "height".into(),
            signature: HEIGHT_PATTERN.into(),
            offset: HEIGHT_HOOK_OFFSET,
            action: HookAction::SetRegister {
                register: Gpr::Rax,
                value: settings.height.into(),
            },
        },
    ];
    hooks.extend(aspect_correction(settings));

    Fix {
        name: "Resolution",
        enabled: settings.master_enable,
        hooks,
        patches: vec![
            PatchSite {
                name: "stored width".into(),
                offsets: WIDTH_OFFSETS.to_vec(),
                payload: le_i32(clamp_i32(settings.width)).to_vec(),
            },
            PatchSite {
                name: "stored height".into(),
                offsets: HEIGHT_OFFSETS.to_vec(),
                payload: le_i32(clamp_i32(settings.height)).to_vec(),
            },
        ],
    }
}

/// The configured aspect correction hook, if it is enabled and the aspect ratio reaches its threshold
fn aspect_correction(settings: &Settings) -> Option<HookSite> {
    let correction = settings.aspect_correction.as_ref()?;
    if !correction.enable {
        return None;
    }
    if settings.aspect_ratio < correction.min_aspect_ratio {
        debug!(
            "Aspect correction not needed below {} (have {})",
            correction.min_aspect_ratio, settings.aspect_ratio
        );
        return None;
    }

    let value = i64::from(settings.height).saturating_add(correction.addend);
    Some(HookSite {
        name: "aspect correction".into(),
        signature: correction.pattern.clone(),
        offset: correction.offset,
        action: HookAction::SetRegister {
            register: correction.register,
            // registers hold the two's complement of negative values
            value: value as u64,
        },
    })
}

/// Dimensions are stored as signed 32-bit integers
fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::tests::RecordingBackend;
    use crate::fix::{FixOrchestrator, FixOutcome, SiteState};
    use crate::hook::Registers;
    use crate::settings::{AspectCorrection, Config, ResolutionConfig};

    /// Resolved settings for a configured resolution
    fn settings(width: u32, height: u32) -> Settings {
        let mut config: Config = toml::from_str("").unwrap();
        config.resolution = ResolutionConfig { width, height };
        Settings::resolve(config, &crate::host::Desktop).unwrap()
    }

    /// An enabled correction for `rcx` from 2.0 up
    fn correction() -> AspectCorrection {
        AspectCorrection {
            enable: true,
            pattern: "8B 4C 24 ?? 89".into(),
            offset: 4,
            register: Gpr::Rcx,
            addend: 1,
            min_aspect_ratio: 2.0,
        }
    }

    /// Runs a fix's handler for the site called `name`
    fn run_handler(fix: &Fix, name: &str) -> Registers {
        let site = fix.hooks.iter().find(|site| site.name == name).unwrap();
        let mut registers = Registers::default();
        site.action.handler()(&mut registers);
        registers
    }

    #[test]
    fn test_sites() {
        let fix = fix(&settings(3440, 1440));
        assert!(fix.enabled);
        assert_eq!(fix.hooks.len(), 2);
        assert_eq!(fix.hooks[1].offset, 6);

        assert_eq!(run_handler(&fix, "width").rax, 3440);
        assert_eq!(run_handler(&fix, "height").rax, 1440);

        assert_eq!(fix.patches[0].offsets, [0x25E50A0]);
        assert_eq!(fix.patches[0].payload, [0x70, 0x0D, 0x00, 0x00]);
        assert_eq!(fix.patches[1].offsets, [0x25E50A4]);
        assert_eq!(fix.patches[1].payload, [0xA0, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_master_disable() {
        let mut settings = settings(3440, 1440);
        settings.master_enable = false;
        settings.aspect_correction = Some(correction());

        let mut orchestrator = FixOrchestrator::new(RecordingBackend::new(vec![0x44; 64]));
        let report = orchestrator.run(&fix(&settings));

        assert_eq!(report.outcome(), FixOutcome::Disabled);
        let backend = orchestrator.into_backend();
        assert!(backend.scans.is_empty());
        assert!(backend.hooks.is_empty());
        assert!(backend.patches.is_empty());
    }

    #[test]
    fn test_aspect_correction() {
        let mut ultrawide = settings(3440, 1440);
        ultrawide.aspect_correction = Some(correction());
        let fix = fix(&ultrawide);
        assert_eq!(fix.hooks.len(), 3);
        assert_eq!(fix.hooks[2].signature, "8B 4C 24 ?? 89");
        assert_eq!(run_handler(&fix, "aspect correction").rcx, 1441);

        // below the threshold
        let mut wide = settings(1920, 1080);
        wide.aspect_correction = Some(correction());
        assert_eq!(super::fix(&wide).hooks.len(), 2);

        // switched off
        ultrawide.aspect_correction = Some(AspectCorrection {
            enable: false,
            ..correction()
        });
        assert_eq!(super::fix(&ultrawide).hooks.len(), 2);
    }

    #[test]
    /// A malformed correction pattern keeps the whole fix from touching the image
    fn test_malformed_correction() {
        let mut settings = settings(3440, 1440);
        settings.aspect_correction = Some(AspectCorrection {
            pattern: "8B ZZ".into(),
            ..correction()
        });

        let mut orchestrator = FixOrchestrator::new(RecordingBackend::new(vec![0x44; 64]));
        let report = orchestrator.run(&fix(&settings));
        assert_eq!(report.outcome(), FixOutcome::Skipped);
        assert!(report.sites.iter().all(|site| site.state == SiteState::Skipped));

        let backend = orchestrator.into_backend();
        assert!(backend.scans.is_empty());
        assert!(backend.hooks.is_empty());
        assert!(backend.patches.is_empty());
    }

    #[test]
    /// Both hooks and both patches apply against an image carrying both signatures
    fn test_apply() {
        let mut image = vec![0u8; 0x40];
        image[0x08..0x1a].copy_from_slice(&[
            0x44, 0x8B, 0xC0, 0x41, 0x8D, 0x50, 0x01, 0x48, 0x8B, 0x4C, 0x24, 0x30, 0xFF, 0x15, 0x11, 0x22,
            0x33, 0x44,
        ]);
        image[0x20..0x2c].copy_from_slice(&[
            0xFF, 0x15, 0x55, 0x66, 0x77, 0x88, 0x44, 0x8B, 0xC0, 0x45, 0x8B, 0xC8,
        ]);

        let mut orchestrator = FixOrchestrator::new(RecordingBackend::new(image));
        let report = orchestrator.run(&fix(&settings(3440, 1440)));
        assert_eq!(report.outcome(), FixOutcome::Applied);
        assert!(report.sites.iter().all(|site| site.state == SiteState::Applied));

        let backend = orchestrator.into_backend();
        let hooked: Vec<_> = backend.hooks.iter().map(|(address, _)| address - backend.base).collect();
        // the width signature's own `FF 15` also matches the height pattern's prefix, but not its tail
        assert_eq!(hooked, [0x08, 0x26]);
        assert_eq!(backend.patches.len(), 2);
    }
}
