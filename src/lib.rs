#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod entry;
pub mod error;
pub mod fix;
pub mod hook;
pub mod host;
pub mod logging;
pub mod patcher;
pub mod ready;
pub mod scanner;
pub mod settings;
pub mod signature;

pub use error::FixError;
pub use hook::{Handler, MidHook, Registers};
pub use patcher::PatchWriter;
pub use scanner::{ImageRegion, ImageScanner, MatchPolicy, ScanMatch};
pub use signature::ByteSignature;
