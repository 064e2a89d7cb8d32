//! # Settings
//!
//! Loads `sigfix.toml` and resolves it into the immutable [`Settings`] every fix reads.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::hook::Gpr;
use crate::scanner::MatchPolicy;

/// Config file name
pub const CONFIG_FILE: &str = "sigfix.toml";

/// Errors while loading or resolving the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Could not read {}: {source}", path.display())]
    Read {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// The file is not valid TOML or does not match the expected shape
    #[error("Could not parse {}: {source}", path.display())]
    Parse {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
    /// Width or height is 0 and the desktop size is unknown
    #[error("Resolution is unset and the desktop size is unavailable")]
    UnknownResolution,
}

/// Raw contents of the config file
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Free-form name, only logged
    #[serde(default)]
    pub name: String,
    /// Gates every fix
    #[serde(default = "default_true")]
    pub master_enable: bool,
    /// Target output size, 0 meaning "use the desktop size"
    #[serde(default)]
    pub resolution: ResolutionConfig,
    /// Per-fix options
    #[serde(default)]
    pub fixes: FixesConfig,
    /// Scanner options
    #[serde(default)]
    pub scan: ScanConfig,
    /// When to start scanning
    #[serde(default)]
    pub startup: StartupConfig,
}

/// `[resolution]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionConfig {
    #[serde(default)]
    #[allow(missing_docs)]
    pub width: u32,
    #[serde(default)]
    #[allow(missing_docs)]
    pub height: u32,
}

/// `[fixes]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixesConfig {
    /// `[fixes.fov]`
    #[serde(default)]
    pub fov: FovConfig,
    /// `[fixes.resolution]`
    #[serde(default)]
    pub resolution: ResolutionFixConfig,
}

/// `[fixes.fov]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FovConfig {
    /// Whether the FOV fix runs (also requires `masterEnable`)
    #[serde(default)]
    pub enable: bool,
    /// Desired field of view in degrees, as it would look at 16:9
    #[serde(default = "default_fov")]
    pub value: f32,
}

impl Default for FovConfig {
    fn default() -> Self {
        Self {
            enable: false,
            value: default_fov(),
        }
    }
}

/// `[fixes.resolution]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionFixConfig {
    /// Optional point correction for one rendering path
    #[serde(default)]
    pub aspect_correction: Option<AspectCorrection>,
}

/// `[fixes.resolution.aspectCorrection]`
///
/// Installs one extra hook that loads `height + addend` into `register`, but only when the resolved
/// aspect ratio is at least `min_aspect_ratio`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectCorrection {
    /// Whether the correction may be installed at all
    #[serde(default)]
    pub enable: bool,
    /// Signature of the site
    pub pattern: String,
    /// Hook offset from the start of the match
    #[serde(default)]
    pub offset: usize,
    /// Register receiving the corrected height
    #[serde(default = "default_register")]
    pub register: Gpr,
    /// Added to the height
    #[serde(default = "default_addend")]
    pub addend: i64,
    /// Smallest aspect ratio the correction applies to
    #[serde(default)]
    pub min_aspect_ratio: f32,
}

/// `[scan]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// What to do when a signature matches more than once
    #[serde(default)]
    pub policy: MatchPolicy,
}

/// `[startup]`, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupConfig {
    /// Wait before the first readiness probe
    pub delay_ms: u64,
    /// First wait between probes
    pub retry_interval_ms: u64,
    /// Longest wait between probes
    pub max_interval_ms: u64,
    /// Total time spent probing before giving up
    pub timeout_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            retry_interval_ms: 250,
            max_interval_ms: 2000,
            timeout_ms: 10_000,
        }
    }
}

/// serde default
fn default_true() -> bool {
    true
}

/// serde default
fn default_fov() -> f32 {
    90.0
}

/// serde default
fn default_register() -> Gpr {
    Gpr::Rax
}

/// serde default
fn default_addend() -> i64 {
    1
}

impl Config {
    /// Reads and parses a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Picks the config file: next to the library if one exists there, otherwise the working directory
    pub fn locate(library_dir: Option<&Path>) -> PathBuf {
        library_dir
            .map(|dir| dir.join(CONFIG_FILE))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }
}

/// Source of the desktop size used when no resolution is configured
pub trait DisplayInfo {
    /// Current desktop width and height in pixels
    fn desktop_size(&self) -> Option<(u32, u32)>;
}

/// Fully resolved, immutable settings
///
/// Hook handlers capture the values they need from this by value at install time.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Free-form name
    pub name: String,
    /// Gates every fix
    pub master_enable: bool,
    /// Target width, never 0
    pub width: u32,
    /// Target height, never 0
    pub height: u32,
    /// `width / height`
    pub aspect_ratio: f32,
    /// FOV fix switch
    pub fov_enable: bool,
    /// FOV fix target in degrees
    pub fov_value: f32,
    /// Optional aspect correction site
    pub aspect_correction: Option<AspectCorrection>,
    /// Ambiguous match policy
    pub policy: MatchPolicy,
    /// Readiness timing
    pub startup: StartupConfig,
}

impl Settings {
    /// Resolves `config`, falling back to the desktop size if either dimension is 0
    pub fn resolve(config: Config, display: &impl DisplayInfo) -> Result<Self, ConfigError> {
        let ResolutionConfig { width, height } = config.resolution;
        let (width, height) = if width == 0 || height == 0 {
            display
                .desktop_size()
                .filter(|&(w, h)| w > 0 && h > 0)
                .ok_or(ConfigError::UnknownResolution)?
        } else {
            (width, height)
        };

        Ok(Self {
            name: config.name,
            master_enable: config.master_enable,
            width,
            height,
            aspect_ratio: width as f32 / height as f32,
            fov_enable: config.fixes.fov.enable,
            fov_value: config.fixes.fov.value,
            aspect_correction: config.fixes.resolution.aspect_correction,
            policy: config.scan.policy,
            startup: config.startup,
        })
    }

    /// Aspect ratio reduced by the greatest common divisor, e.g. `(43, 18)` for 3440x1440
    pub fn aspect_label(&self) -> (u32, u32) {
        let divisor = gcd(self.width, self.height).max(1);
        (self.width / divisor, self.height / divisor)
    }

    /// Writes every resolved value to the log
    pub fn log(&self) {
        let (w, h) = self.aspect_label();
        info!("Name: {}", self.name);
        info!("MasterEnable: {}", self.master_enable);
        info!("Resolution.Width: {}", self.width);
        info!("Resolution.Height: {}", self.height);
        info!("Resolution.AspectRatio: {}:{} {}", w, h, self.aspect_ratio);
        info!("Fix.Fov.Enable: {}", self.fov_enable);
        info!("Fix.Fov.Value: {}", self.fov_value);
        match &self.aspect_correction {
            Some(correction) => info!(
                "Fix.Resolution.AspectCorrection: enable={} pattern='{}' offset=0x{:x} {} += {} from {}",
                correction.enable,
                correction.pattern,
                correction.offset,
                correction.register,
                correction.addend,
                correction.min_aspect_ratio
            ),
            None => info!("Fix.Resolution.AspectCorrection: none"),
        }
        info!("Scan.Policy: {:?}", self.policy);
    }
}

/// Greatest common divisor
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Display with a fixed size
    struct Desktop(Option<(u32, u32)>);

    impl DisplayInfo for Desktop {
        fn desktop_size(&self) -> Option<(u32, u32)> {
            self.0
        }
    }

    /// Writes `content` to a temporary config file
    fn config_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full() {
        let file = config_file(
            r#"
name = "Ultrawide"
masterEnable = true

[resolution]
width = 3440
height = 1440

[fixes.fov]
enable = true
value = 90.0

[fixes.resolution.aspectCorrection]
enable = true
pattern = "8B ?? ?? 89 ?? ??"
offset = 3
register = "rcx"
addend = 1
minAspectRatio = 2.3

[scan]
policy = "unique"

[startup]
delayMs = 500
timeoutMs = 4000
"#,
        );
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.name, "Ultrawide");
        assert!(config.master_enable);
        assert_eq!(config.resolution, ResolutionConfig { width: 3440, height: 1440 });
        assert!(config.fixes.fov.enable);
        assert_eq!(config.fixes.fov.value, 90.0);
        assert_eq!(config.scan.policy, MatchPolicy::Unique);

        let correction = config.fixes.resolution.aspect_correction.unwrap();
        assert_eq!(correction.register, Gpr::Rcx);
        assert_eq!(correction.offset, 3);
        assert_eq!(correction.addend, 1);

        // unset startup keys keep their defaults
        assert_eq!(config.startup.delay_ms, 500);
        assert_eq!(config.startup.timeout_ms, 4000);
        assert_eq!(config.startup.retry_interval_ms, 250);
    }

    #[test]
    /// Only the keys the original config format requires
    fn test_load_minimal() {
        let file = config_file(
            r#"
name = "Minimal"
masterEnable = false

[resolution]
width = 0
height = 0

[fixes.fov]
enable = false
value = 75.5
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert!(!config.master_enable);
        assert_eq!(config.fixes.fov.value, 75.5);
        assert_eq!(config.fixes.resolution.aspect_correction, None);
        assert_eq!(config.scan.policy, MatchPolicy::First);
        assert_eq!(config.startup, StartupConfig::default());
    }

    #[test]
    fn test_load_errors() {
        let missing = tempfile::tempdir().unwrap().path().join(CONFIG_FILE);
        assert!(matches!(Config::load(missing), Err(ConfigError::Read { .. })));

        let file = config_file("masterEnable = \"yes\"");
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_locate() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::locate(Some(dir.path())), PathBuf::from(CONFIG_FILE));
        assert_eq!(Config::locate(None), PathBuf::from(CONFIG_FILE));

        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        assert_eq!(Config::locate(Some(dir.path())), dir.path().join(CONFIG_FILE));
    }

    #[test]
    fn test_resolve_configured() {
        let config = Config {
            resolution: ResolutionConfig { width: 3440, height: 1440 },
            ..toml::from_str("").unwrap()
        };
        let settings = Settings::resolve(config, &Desktop(Some((1920, 1080)))).unwrap();

        assert_eq!((settings.width, settings.height), (3440, 1440));
        assert!((settings.aspect_ratio - 2.3889).abs() < 1e-4);
        assert_eq!(gcd(3440, 1440), 80);
        assert_eq!(settings.aspect_label(), (43, 18));
    }

    #[test]
    /// 0 in either dimension falls back to the desktop size
    fn test_resolve_desktop_fallback() {
        let config: Config = toml::from_str("").unwrap();
        let settings = Settings::resolve(config.clone(), &Desktop(Some((2560, 1080)))).unwrap();
        assert_eq!((settings.width, settings.height), (2560, 1080));
        assert_eq!(settings.aspect_label(), (64, 27));
        assert!((settings.aspect_ratio - 2560.0 / 1080.0).abs() < 1e-6);

        let half = Config {
            resolution: ResolutionConfig { width: 3440, height: 0 },
            ..config.clone()
        };
        let settings = Settings::resolve(half, &Desktop(Some((1920, 1080)))).unwrap();
        assert_eq!((settings.width, settings.height), (1920, 1080));

        assert!(matches!(
            Settings::resolve(config, &Desktop(None)),
            Err(ConfigError::UnknownResolution)
        ));
    }
}
