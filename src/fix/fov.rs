//! Field of view correction
//!
//! The host scales its FOV vertically from a 16:9 baseline. The hook at the master FOV write converts the
//! configured FOV to what the host needs at the target aspect ratio, then rescales it by how far the value
//! being written is from the host's own maximum.

use std::f32::consts::PI;

use crate::settings::Settings;

use super::{Fix, HookAction, HookSite};

/// Aspect ratio the host's FOV is tuned for
pub const NATIVE_ASPECT: f32 = 16.0 / 9.0;

/// FOV the host treats as its maximum; the value written at the hook site is relative to it
pub const HOST_ASSUMED_MAX_FOV: f32 = 120.0;

/// Store of the final FOV value
pub const PATTERN: &str = "F3 0F 11 ?? ?? ?? ?? ?? 8B ?? ?? ?? ?? ?? 89 ?? ?? ?? ?? ?? 48 83 ?? ?? 5B C3";

/// The `movss` store itself
pub const HOOK_OFFSET: usize = 0;

/// FOV in degrees that gives `configured` degrees of 16:9 view at `aspect_ratio`
pub fn target_fov(configured: f32, aspect_ratio: f32) -> f32 {
    ((configured * PI / 360.0).tan() / NATIVE_ASPECT * aspect_ratio).atan() * 360.0 / PI
}

/// Replacement for `current`, the value the host is about to store
pub fn corrected_fov(current: f32, configured: f32, aspect_ratio: f32) -> f32 {
    target_fov(configured, aspect_ratio) * (current / HOST_ASSUMED_MAX_FOV)
}

/// The FOV fix for `settings`
pub fn fix(settings: &Settings) -> Fix {
    Fix {
        name: "FOV",
        enabled: settings.master_enable && settings.fov_enable,
        hooks: vec![HookSite {
            name: "master FOV".into(),
            signature: PATTERN.into(),
            offset: HOOK_OFFSET,
            action: HookAction::CorrectFov {
                configured: settings.fov_value,
                aspect_ratio: settings.aspect_ratio,
            },
        }],
        patches: Vec::new(),
    }
}
