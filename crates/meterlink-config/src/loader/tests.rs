//! Tests for configuration loading.

use super::*;
use crate::HandshakePolicy;
use meterlink_protocol::ChainId;
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

/// Write JSON5 contents to a path, creating parent directories if needed.
fn write_json5(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("dir");
    }
    fs::write(path, contents).expect("write");
}

#[test]
fn parse_minimal_config() {
    let config = EngineConfig::load_from_str("{}").expect("config");
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.timeouts.first_chunk_timeout_ms, 180_000);
    assert_eq!(config.timeouts.inter_chunk_timeout_ms, 60_000);
    assert_eq!(config.timeouts.final_grace_ms, 3_000);
    assert_eq!(config.rag.vector_dimension, 384);
    assert_eq!(config.rag.upload_batch_size, 1_000);
    assert_eq!(config.encryption.handshake_policy, HandshakePolicy::PerOperation);
}

#[test]
fn rejects_unknown_top_level_key() {
    let err = EngineConfig::load_from_str("{ unexpected: true }").unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("unknown key"));
}

#[test]
fn rejects_invalid_handshake_policy() {
    let json5 = r#"{ encryption: { handshake_policy: "never" } }"#;
    let err = EngineConfig::load_from_str(json5).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("encryption.handshake_policy"));
}

#[test]
fn rejects_out_of_range_threshold() {
    let json5 = "{ streaming: { context_warning_threshold: 1.5 } }";
    let err = EngineConfig::load_from_str(json5).unwrap_err();
    match err {
        ConfigError::InvalidField { path, .. } => {
            assert_eq!(path, "config:streaming.context_warning_threshold");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn accepts_chain_ids_as_numbers_or_strings() {
    let json5 = r#"{ network: { supported_chains: [84532, "5611"] } }"#;
    let config = EngineConfig::load_from_str(json5).expect("config");
    assert_eq!(
        config.network.supported_chains,
        vec![ChainId(84532), ChainId(5611)]
    );
    assert!(config.supports_chain(ChainId(5611)));
    assert!(!config.supports_chain(ChainId(1)));
}

#[test]
fn runtime_layer_overrides_user_layer() {
    let temp = TempDir::new().expect("tmp");
    let user = temp.path().join("user.json5");
    write_json5(
        &user,
        "{ timeouts: { handshake_timeout_ms: 5000, request_timeout_ms: 7000 } }",
    );
    let runtime = temp.path().join("runtime.json5");
    write_json5(&runtime, "{ timeouts: { handshake_timeout_ms: 9000 } }");

    let options = LayeredConfigOptions::new()
        .with_user_path(&user)
        .with_runtime_path(&runtime);
    let config = EngineConfig::load_layered(options).expect("layered");
    assert_eq!(config.timeouts.handshake_timeout_ms, 9_000);
    assert_eq!(config.timeouts.request_timeout_ms, 7_000);
}

#[test]
fn missing_user_layer_is_skipped() {
    let temp = TempDir::new().expect("tmp");
    let options = LayeredConfigOptions::new().with_user_path(temp.path().join("absent.json5"));
    let config = EngineConfig::load_layered(options).expect("layered");
    assert_eq!(config, EngineConfig::default());
}

#[test]
fn layer_errors_name_the_layer() {
    let temp = TempDir::new().expect("tmp");
    let runtime = temp.path().join("runtime.json5");
    write_json5(&runtime, "{ rag: { vector_dimension: -1 } }");
    let options = LayeredConfigOptions::new()
        .without_user_layer()
        .with_runtime_path(&runtime);
    let err = EngineConfig::load_layered(options).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("runtime("));
    assert!(msg.contains("rag.vector_dimension"));
}

#[test]
fn builder_applies_overrides() {
    let config = EngineConfig::builder()
        .supported_chains([ChainId(84532)])
        .persist_conversations(true)
        .build();
    assert!(config.storage.persist_conversations);
    assert!(config.supports_chain(ChainId(84532)));
    config.validate().expect("valid");
}

#[test]
fn missing_runtime_layer_reports_its_path() {
    let temp = TempDir::new().expect("tmp");
    let runtime = temp.path().join("missing.json5");
    let options = LayeredConfigOptions::new()
        .without_user_layer()
        .with_runtime_path(&runtime);
    match EngineConfig::load_layered(options).unwrap_err() {
        ConfigError::Read { path, .. } => assert_eq!(path, runtime),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn malformed_json5_is_a_parse_error() {
    let err = EngineConfig::load_from_str("{ timeouts: ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse { ref origin, .. } if origin == "inline config"));
}

#[test]
fn later_layers_replace_arrays() {
    let temp = TempDir::new().expect("tmp");
    let user = temp.path().join("user.json5");
    write_json5(&user, "{ network: { supported_chains: [84532, 5611] } }");
    let runtime = temp.path().join("runtime.json5");
    write_json5(&runtime, "{ network: { supported_chains: [1] } }");

    let options = LayeredConfigOptions::new()
        .with_user_path(&user)
        .with_runtime_path(&runtime);
    let config = EngineConfig::load_layered(options).expect("layered");
    assert_eq!(config.network.supported_chains, vec![ChainId(1)]);
}
