//! Shared foundation for the Aegis runtime: configuration, error taxonomy,
//! and the small id newtypes used across crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::AegisConfig;
pub use error::{AegisError, Result};
