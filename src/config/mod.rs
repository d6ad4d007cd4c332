//! Configuration module
//!
//! Handles loading the bridge configuration.

mod bridge;

pub use bridge::*;
