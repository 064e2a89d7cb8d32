//! # Entry
//!
//! Startup sequence run once on a worker thread after the library is loaded into the host.

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::fix::{fov, resolution, Fix, FixOrchestrator, FixReport, LiveBackend};
use crate::host::{self, Desktop};
use crate::logging::{self, LOG_FILE};
use crate::ready::{self, Backoff, Readiness};
use crate::scanner::ImageScanner;
use crate::settings::{Config, Settings};
use crate::signature::ByteSignature;

/// Runs [`run`] and logs its error, if any. Never panics.
pub fn attach(library: usize) {
    raise_priority();
    let dir = host::module_dir(library);
    let log_path = dir
        .as_ref()
        .map(|dir| dir.join(LOG_FILE))
        .unwrap_or_else(|| PathBuf::from(LOG_FILE));
    // without a log file there is nowhere to report anything, the fixes still run
    let _ = logging::init(&log_path);

    if let Err(e) = run(dir) {
        error!("{:#}", e);
    }
}

/// Loads the settings, waits for the host and applies every fix.
///
/// `library_dir` is searched for the config file before the working directory.
pub fn run(library_dir: Option<PathBuf>) -> Result<Vec<FixReport>> {
    let module = host::main_module().context("Failed to inspect the host module")?;
    info!("-------------------------------------");
    info!("Module Name: {}", module.name());
    info!("Module Path: {}", module.path.display());
    info!("Module Addr: 0x{:x}", module.base);

    let config_path = Config::locate(library_dir.as_deref());
    let config = Config::load(&config_path)?;
    info!("Loaded config from {}", config_path.display());
    let settings = Settings::resolve(config, &Desktop)?;
    settings.log();

    let fixes = [resolution::fix(&settings), fov::fix(&settings)];
    let scanner = ImageScanner::new(module.image(), settings.policy);
    wait_for_host(&scanner, &fixes, &Backoff::from(settings.startup));

    let mut orchestrator = FixOrchestrator::new(LiveBackend::new(scanner));
    let reports: Vec<_> = fixes.iter().map(|fix| orchestrator.run(fix)).collect();
    info!(
        "Installed {} hooks, startup complete",
        orchestrator.backend().hooks().len()
    );
    Ok(reports)
}

/// Waits until the first enabled fix's first signature shows up in the image
fn wait_for_host(scanner: &ImageScanner, fixes: &[Fix], backoff: &Backoff) {
    let signature = match fixes
        .iter()
        .find_map(Fix::probe_signature)
        .map(ByteSignature::parse)
    {
        Some(Ok(signature)) => signature,
        // nothing enabled, or a malformed pattern the fix itself will report
        _ => return,
    };

    let readiness = ready::wait_until_ready(
        || !scanner.scan(&signature).is_empty(),
        backoff,
        thread::sleep,
    );
    if let Readiness::TimedOut { attempts } = readiness {
        warn!("'{}' never appeared after {} probes", signature, attempts);
    }
}

/// The startup sequence competes with the host's own loading threads
#[cfg(windows)]
fn raise_priority() {
    use windows::Win32::System::Threading::{GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST};

    let _ = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_HIGHEST) };
}

/// The startup sequence competes with the host's own loading threads
#[cfg(not(windows))]
fn raise_priority() {}

/// Runs `work` on a new named thread. Returns false if the thread could not be created.
pub fn spawn_worker<F>(work: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name("sigfix".into())
        .spawn(work)
        .is_ok()
}

/// Library entry point. Starts the worker thread on process attach and ignores everything else.
#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
extern "system" fn DllMain(
    module: windows::Win32::Foundation::HMODULE,
    reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> windows::Win32::Foundation::BOOL {
    use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    if reason == DLL_PROCESS_ATTACH {
        let library = module.0 as usize;
        // nothing can be reported this early, and the host must load either way
        let _ = spawn_worker(move || attach(library));
    }
    windows::Win32::Foundation::TRUE
}
