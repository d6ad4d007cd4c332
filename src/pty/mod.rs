//! PTY management module
//!
//! Defines the terminal agent contract and its native implementation.
//! Uses portable-pty for cross-platform compatibility.

mod backend;
mod native;

pub use backend::*;
pub use native::NativePtyAgent;
