//! Errors raised while loading or validating an engine config.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer file could not be read.
    #[error("failed to read config layer {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A layer is not valid JSON5.
    #[error("failed to parse JSON5 in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: json5::Error,
    },
    /// The merged document does not deserialize into [`crate::EngineConfig`].
    #[error("config does not match the engine schema: {0}")]
    Decode(#[from] serde_json::Error),
    /// A field is present but holds an unusable value.
    #[error("invalid config at {path}: {message}")]
    InvalidField { path: String, message: String },
}
