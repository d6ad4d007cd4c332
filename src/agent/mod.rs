//! Agent session management module
//!
//! Handles opening terminal agent sessions and tearing them down exactly once.

mod session;

pub use session::*;

#[cfg(test)]
pub(crate) use session::fake;
