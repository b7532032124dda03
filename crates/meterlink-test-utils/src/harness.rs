//! Engine wired to in-memory collaborators.

use crate::host::MockHost;
use crate::services::{
    StaticHostKeys, StubCheckpointSource, StubPaymentService, StubStorageService,
};
use crate::sink::RecordingSink;
use meterlink_config::EngineConfig;
use meterlink_core::{Collaborators, SessionEngine, StartSessionRequest};
use meterlink_crypto::Secp256k1Crypto;
use meterlink_protocol::ChainId;
use std::sync::Arc;
use std::time::Duration;

pub const HOST_ADDRESS: &str = "0xA11CE0000000000000000000000000000000B0B";
pub const ENDPOINT: &str = "ws://host.test:8080/v1/ws";
pub const CHAIN_ID: ChainId = ChainId(84532);

/// A [`SessionEngine`] plus handles on every collaborator it was built with.
pub struct Harness {
    pub engine: Arc<SessionEngine>,
    pub host: MockHost,
    pub payment: Arc<StubPaymentService>,
    pub storage: Arc<StubStorageService>,
    pub host_keys: Arc<StaticHostKeys>,
    pub checkpoints: Arc<StubCheckpointSource>,
    pub sink: Arc<RecordingSink>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Secp256k1Crypto::generate())
    }

    /// Harness whose client identity is `crypto`, e.g. one holding a
    /// recovery key.
    pub fn build(config: EngineConfig, crypto: Secp256k1Crypto) -> Self {
        let host = MockHost::new();
        let payment = Arc::new(StubPaymentService::new());
        let storage = Arc::new(StubStorageService::new());
        let host_keys = Arc::new(StaticHostKeys::new().with_key(HOST_ADDRESS, host.public_key()));
        let checkpoints = Arc::new(StubCheckpointSource::new());
        let sink = Arc::new(RecordingSink::new());
        let collaborators = Collaborators::new()
            .with_payment(payment.clone())
            .with_storage(storage.clone())
            .with_crypto(Arc::new(crypto))
            .with_host_keys(host_keys.clone())
            .with_connector(Arc::new(host.clone()))
            .with_checkpoint_source(checkpoints.clone())
            .with_event_sink(sink.clone());
        let engine = SessionEngine::new(config, collaborators).expect("engine builds");
        Self {
            engine: Arc::new(engine),
            host,
            payment,
            storage,
            host_keys,
            checkpoints,
            sink,
        }
    }

    /// Session request against the mock host.
    pub fn request(&self, encryption: bool) -> StartSessionRequest {
        StartSessionRequest::new(CHAIN_ID, HOST_ADDRESS, ENDPOINT, "llama-3.1-8b")
            .with_encryption(encryption)
            .with_price_per_token(2_000)
            .with_deposit(1_000_000)
    }
}

/// Poll `condition` until it holds; panics after ~5s of (possibly paused) time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
