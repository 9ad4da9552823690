//! Configuration module for the execution sandbox
//!
//! Supports YAML configuration files with defaults for every field, and per-language
//! overrides of the builtin language profiles.

pub mod types;
pub mod loader;

pub use types::*;
pub use loader::*;
