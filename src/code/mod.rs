//! # Code
//!
//! Machine code emitted by the hooks

pub mod x64;
