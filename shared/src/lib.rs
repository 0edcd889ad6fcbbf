//! # Shared Module for the Device Gateway
//!
//! This crate provides the types, errors, configuration and constants used
//! across the gateway: the device data model (endpoints, resource links,
//! ownership status, content), the uniform status taxonomy every operation
//! reports, and the well-known resource identifiers devices publish.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::*;
pub use constants::*;
pub use error::*;
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
