//! Configuration module for the grading service
//!
//! Loads one immutable [`AutotestConfig`] per process from YAML, with
//! environment substitution and overrides.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::AutotestError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<AutotestConfig, AutotestError> {
    ConfigLoader::from_file(path).await
}
