//! Schema validation helpers for engine JSON5 configuration.

use crate::ConfigError;
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
pub(super) fn validate_layer_schema(value: &Value, layer: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    let allowed = [
        "$schema",
        "timeouts",
        "streaming",
        "encryption",
        "rag",
        "network",
        "storage",
    ];
    ensure_allowed_keys(map, &allowed, layer, "")?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("timeouts") {
        validate_timeouts(value, layer, "timeouts")?;
    }
    if let Some(value) = map.get("streaming") {
        validate_streaming(value, layer, "streaming")?;
    }
    if let Some(value) = map.get("encryption") {
        validate_encryption(value, layer, "encryption")?;
    }
    if let Some(value) = map.get("rag") {
        validate_rag(value, layer, "rag")?;
    }
    if let Some(value) = map.get("network") {
        validate_network(value, layer, "network")?;
    }
    if let Some(value) = map.get("storage") {
        validate_storage(value, layer, "storage")?;
    }

    Ok(())
}

/// Validate the "timeouts" block.
fn validate_timeouts(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let allowed = [
        "handshake_timeout_ms",
        "first_chunk_timeout_ms",
        "inter_chunk_timeout_ms",
        "final_grace_ms",
        "request_timeout_ms",
    ];
    ensure_allowed_keys(map, &allowed, layer, path)?;
    for key in allowed {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

/// Validate the "streaming" block.
fn validate_streaming(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["context_warning_threshold"], layer, path)?;
    if let Some(value) = map.get("context_warning_threshold") {
        expect_f64(value, layer, &join_path(path, "context_warning_threshold"))?;
    }
    Ok(())
}

/// Validate the "encryption" block.
fn validate_encryption(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["handshake_policy", "host_key_cache_ttl_secs"],
        layer,
        path,
    )?;
    if let Some(value) = map.get("handshake_policy") {
        let policy_path = join_path(path, "handshake_policy");
        match value.as_str() {
            Some("per_operation" | "per_connection") => {}
            _ => {
                return Err(invalid_field(
                    layer,
                    &policy_path,
                    "expected one of per_operation, per_connection",
                ));
            }
        }
    }
    if let Some(value) = map.get("host_key_cache_ttl_secs") {
        expect_u64(value, layer, &join_path(path, "host_key_cache_ttl_secs"))?;
    }
    Ok(())
}

/// Validate the "rag" block.
fn validate_rag(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let allowed = ["vector_dimension", "upload_batch_size", "max_top_k"];
    ensure_allowed_keys(map, &allowed, layer, path)?;
    for key in allowed {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

/// Validate the "network" block.
fn validate_network(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["supported_chains"], layer, path)?;
    if let Some(value) = map.get("supported_chains") {
        let chains_path = join_path(path, "supported_chains");
        let arr = expect_array(value, layer, &chains_path)?;
        for (idx, entry) in arr.iter().enumerate() {
            let is_id = entry.is_u64()
                || entry
                    .as_str()
                    .is_some_and(|raw| raw.trim().parse::<u64>().is_ok());
            if !is_id {
                return Err(invalid_field(
                    layer,
                    &format!("{chains_path}[{idx}]"),
                    "expected chain id",
                ));
            }
        }
    }
    Ok(())
}

/// Validate the "storage" block.
fn validate_storage(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["persist_conversations"], layer, path)?;
    if let Some(value) = map.get("persist_conversations") {
        expect_bool(value, layer, &join_path(path, "persist_conversations"))?;
    }
    Ok(())
}

/// Expect a JSON object or return a typed error.
fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid_field(layer, path, "expected object")),
    }
}

/// Expect a JSON array or return a typed error.
fn expect_array<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Vec<Value>, ConfigError> {
    match value {
        Value::Array(arr) => Ok(arr),
        _ => Err(invalid_field(layer, path, "expected array")),
    }
}

fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.as_str().is_some() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected string"))
    }
}

fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if matches!(value, Value::Bool(_)) {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected bool"))
    }
}

/// Expect a non-negative integer.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

fn expect_f64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_f64() || value.is_u64() || value.is_i64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected number"))
    }
}

/// Ensure an object contains only allowed keys.
fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(invalid_field(layer, &join_path(path, key), "unknown key"));
        }
    }
    Ok(())
}

/// Join nested paths for better error messages.
fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Build a structured invalid-field error.
pub(super) fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let normalized_path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{normalized_path}"),
        message: message.to_string(),
    }
}
