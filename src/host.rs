//! # Host
//!
//! Queries about the process the library is loaded into: the main module's image and the desktop size.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scanner::ImageRegion;
use crate::settings::DisplayInfo;

/// Errors while inspecting the host
#[derive(Debug, Error)]
pub enum HostError {
    /// A Win32 call failed
    #[cfg(windows)]
    #[error("{call} failed: {source}")]
    Windows {
        /// Name of the failing call
        call: &'static str,
        /// Underlying error
        source: windows::core::Error,
    },
    /// The host is only inspectable on Windows
    #[error("Host inspection is only supported on Windows")]
    Unsupported,
}

/// A module loaded in the host process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Full path of the module's file
    pub path: PathBuf,
    /// Load base
    pub base: usize,
    /// Size of the mapped image
    pub size: usize,
}

impl ModuleInfo {
    /// File name of the module
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The module's image as a scannable region
    pub fn image(&self) -> ImageRegion {
        // Safety: a loaded module stays mapped, and the host's main module is never unloaded
        unsafe { ImageRegion::new(self.base, self.size) }
    }
}

/// The desktop the host renders to
#[derive(Debug, Clone, Copy, Default)]
pub struct Desktop;

impl DisplayInfo for Desktop {
    fn desktop_size(&self) -> Option<(u32, u32)> {
        desktop_size()
    }
}

/// Win32 implementation
#[cfg(windows)]
mod imp {
    use std::ffi::c_void;
    use std::mem;
    use std::path::PathBuf;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{HMODULE, MAX_PATH};
    use windows::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleW};
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;
    use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    use super::{HostError, ModuleInfo};

    /// Path of a loaded module
    pub fn module_path(module: usize) -> Option<PathBuf> {
        let mut buffer = [0u16; MAX_PATH as usize];
        let len = unsafe { GetModuleFileNameW(HMODULE(module as *mut c_void), &mut buffer) } as usize;
        (len > 0).then(|| PathBuf::from(String::from_utf16_lossy(&buffer[..len])))
    }

    /// Image of the executable that started the process
    pub fn main_module() -> Result<ModuleInfo, HostError> {
        unsafe {
            let module = GetModuleHandleW(PCWSTR::null()).map_err(|source| HostError::Windows {
                call: "GetModuleHandleW",
                source,
            })?;

            let mut info = MODULEINFO::default();
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                mem::size_of::<MODULEINFO>() as u32,
            )
            .map_err(|source| HostError::Windows {
                call: "GetModuleInformation",
                source,
            })?;

            Ok(ModuleInfo {
                path: module_path(module.0 as usize).unwrap_or_default(),
                base: info.lpBaseOfDll as usize,
                size: info.SizeOfImage as usize,
            })
        }
    }

    /// Size of the primary monitor
    pub fn desktop_size() -> Option<(u32, u32)> {
        let (width, height) = unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
    }
}

/// Stand-ins for platforms without a host to inspect
#[cfg(not(windows))]
mod imp {
    use std::path::PathBuf;

    use super::{HostError, ModuleInfo};

    pub fn module_path(_module: usize) -> Option<PathBuf> {
        None
    }

    pub fn main_module() -> Result<ModuleInfo, HostError> {
        Err(HostError::Unsupported)
    }

    pub fn desktop_size() -> Option<(u32, u32)> {
        None
    }
}

/// The host's executable module
pub fn main_module() -> Result<ModuleInfo, HostError> {
    imp::main_module()
}

/// Current desktop size, `None` if it cannot be determined
pub fn desktop_size() -> Option<(u32, u32)> {
    imp::desktop_size()
}

/// Directory containing the module whose handle is `module`
pub fn module_dir(module: usize) -> Option<PathBuf> {
    imp::module_path(module).and_then(|path| path.parent().map(Path::to_path_buf))
}
