//! Configuration models and config loading for the session engine.
//!
//! This crate owns the engine config schema, validation, and the small
//! layering logic used to combine a user file with runtime overrides.

mod error;
mod loader;
mod model;

/// Public error type returned by config loading and validation APIs.
pub use error::ConfigError;
/// Layered config options.
pub use loader::LayeredConfigOptions;
/// Configuration schema models.
pub use model::*;
