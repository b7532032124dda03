use meterlink::config::{EngineConfig, HandshakePolicy, LayeredConfigOptions};
use pretty_assertions::assert_eq;
use std::fs;

#[test]
fn runtime_layer_overrides_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("runtime.json5");
    fs::write(
        &path,
        "{ streaming: { context_warning_threshold: 0.9 }, encryption: { handshake_policy: 'per_connection' } }",
    )
    .expect("write config");

    let config = EngineConfig::load_layered(
        LayeredConfigOptions::new()
            .without_user_layer()
            .with_runtime_path(&path),
    )
    .expect("load config");

    assert_eq!(config.streaming.context_warning_threshold, 0.9);
    assert_eq!(
        config.encryption.handshake_policy,
        HandshakePolicy::PerConnection
    );
    config.validate().expect("valid config");
}

#[test]
fn init_logging_can_be_called_twice() {
    meterlink::init_logging();
    meterlink::init_logging();
}
