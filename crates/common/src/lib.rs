//! VmHarness Common Library
//!
//! Shared types and error handling for the VmHarness test harness.

pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{Error, PostconditionFailure, Result};
pub use types::*;

/// VmHarness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
