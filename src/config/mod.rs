//! Configuration Module
//!
//! Handles configuration loading, validation, and the immutable runtime
//! configuration handed to connection creators.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
