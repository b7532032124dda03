//! Public SDK surface for meterlink.
//!
//! This crate re-exports the engine building blocks and provides a small
//! initialization helper to keep consumer setup consistent.

/// Re-export for convenience.
pub use meterlink_config as config;
pub use meterlink_core as core;
/// Re-export for convenience.
pub use meterlink_crypto as crypto;
/// Re-export for convenience.
pub use meterlink_protocol as protocol;

pub use meterlink_core::{Collaborators, EngineError, SessionEngine};

#[inline]
/// Initialize logging using env_logger if the "logging" feature is enabled.
///
/// This is a no-op if the feature is not enabled. Binaries are still expected
/// to call this early in startup to ensure log output is wired up.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::try_init();
    }
}
