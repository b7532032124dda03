//! Config loader: JSON5 parsing, schema checks, and user/runtime layering.
//!
//! A user-level file (`~/.meterlink/meterlink.json5`) is applied first, then
//! runtime override files in order. Every layer is schema-checked on its own
//! before merging so errors point at the file that introduced them.

mod merge;
mod schema;

#[cfg(test)]
mod tests;

use crate::{ConfigError, EngineConfig};
use directories::UserDirs;
use log::{debug, info};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config filename.
const DEFAULT_CONFIG_FILE: &str = "meterlink.json5";
/// Default config directory under the user's home.
const DEFAULT_CONFIG_DIR: &str = ".meterlink";

/// Options controlling which config files are layered.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfigOptions {
    /// Optional user config path (defaults to `~/.meterlink/meterlink.json5`).
    pub user_config_path: Option<PathBuf>,
    /// Runtime override config paths applied last, in order.
    pub runtime_paths: Vec<PathBuf>,
}

impl LayeredConfigOptions {
    /// Options pointing at the default user config location.
    pub fn new() -> Self {
        Self {
            user_config_path: default_user_config_path(),
            runtime_paths: Vec::new(),
        }
    }

    /// Replace the user config path.
    pub fn with_user_path(mut self, path: impl AsRef<Path>) -> Self {
        self.user_config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the user layer entirely.
    pub fn without_user_layer(mut self) -> Self {
        self.user_config_path = None;
        self
    }

    /// Add a runtime override config path that is applied last.
    pub fn with_runtime_path(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_paths.push(path.as_ref().to_path_buf());
        self
    }
}

impl EngineConfig {
    /// Load a single config from a path (no layering).
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("loading config (path={})", path.display());
        let value = read_json5(path)?;
        config_from_value(value, "config")
    }

    /// Load a single config from JSON5 contents (no layering).
    pub fn load_from_str(contents: &str) -> Result<Self, ConfigError> {
        debug!("loading config from raw contents (len={})", contents.len());
        let value = parse_json5(contents, "inline config")?;
        config_from_value(value, "config")
    }

    /// Load the user layer (if present) followed by runtime overrides.
    ///
    /// A missing user file is skipped; a missing runtime file is an error.
    pub fn load_layered(options: LayeredConfigOptions) -> Result<Self, ConfigError> {
        let mut merged = Value::Object(serde_json::Map::new());
        let mut loaded = 0usize;

        if let Some(path) = options.user_config_path.as_deref() {
            if path.exists() {
                let value = load_layer(path, "user")?;
                merge::overlay_layer(&mut merged, value);
                loaded += 1;
            } else {
                debug!("optional user layer missing (path={})", path.display());
            }
        }

        for path in &options.runtime_paths {
            let value = load_layer(path, "runtime")?;
            merge::overlay_layer(&mut merged, value);
            loaded += 1;
        }

        let config = config_from_value(merged, "effective")?;
        info!("layered config loaded (layers={})", loaded);
        Ok(config)
    }

    /// Validate invariants that cannot be expressed in serde.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("timeouts.handshake_timeout_ms", self.timeouts.handshake_timeout_ms),
            ("timeouts.first_chunk_timeout_ms", self.timeouts.first_chunk_timeout_ms),
            ("timeouts.inter_chunk_timeout_ms", self.timeouts.inter_chunk_timeout_ms),
            ("timeouts.final_grace_ms", self.timeouts.final_grace_ms),
            ("timeouts.request_timeout_ms", self.timeouts.request_timeout_ms),
        ];
        for (path, value) in timeouts {
            if value == 0 {
                return Err(schema::invalid_field("config", path, "must be positive"));
            }
        }

        let threshold = self.streaming.context_warning_threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return Err(schema::invalid_field(
                "config",
                "streaming.context_warning_threshold",
                "must be within (0, 1]",
            ));
        }

        if self.rag.vector_dimension == 0 {
            return Err(schema::invalid_field(
                "config",
                "rag.vector_dimension",
                "must be positive",
            ));
        }
        if self.rag.upload_batch_size == 0 {
            return Err(schema::invalid_field(
                "config",
                "rag.upload_batch_size",
                "must be positive",
            ));
        }
        if self.rag.max_top_k == 0 {
            return Err(schema::invalid_field(
                "config",
                "rag.max_top_k",
                "must be positive",
            ));
        }

        Ok(())
    }
}

/// Read, parse, and schema-check one layer file.
fn load_layer(path: &Path, name: &str) -> Result<Value, ConfigError> {
    debug!("loading config layer (layer={}, path={})", name, path.display());
    let value = read_json5(path)?;
    let label = format!("{name}({})", path.display());
    schema::validate_layer_schema(&value, &label)?;
    Ok(value)
}

fn read_json5(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_json5(&contents, &path.display().to_string())
}

fn parse_json5(contents: &str, origin: &str) -> Result<Value, ConfigError> {
    json5::from_str(contents).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn config_from_value(value: Value, label: &str) -> Result<EngineConfig, ConfigError> {
    schema::validate_layer_schema(&value, label)?;
    let config: EngineConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}

/// Default user config path under the home directory.
fn default_user_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE)
    })
}
