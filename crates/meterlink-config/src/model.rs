//! Configuration schema for the session engine.

use meterlink_protocol::ChainId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root config for the session engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// True when the chain is on the allow-list, or the list is empty.
    pub fn supports_chain(&self, chain_id: ChainId) -> bool {
        self.network.supported_chains.is_empty()
            || self.network.supported_chains.contains(&chain_id)
    }
}

/// Builder for assembling an `EngineConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Replace the timeout configuration.
    pub fn timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Replace the streaming configuration.
    pub fn streaming(mut self, streaming: StreamingConfig) -> Self {
        self.config.streaming = streaming;
        self
    }

    /// Replace the encryption configuration.
    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.config.encryption = encryption;
        self
    }

    /// Replace the RAG configuration.
    pub fn rag(mut self, rag: RagConfig) -> Self {
        self.config.rag = rag;
        self
    }

    /// Restrict sessions to the given chains.
    pub fn supported_chains(mut self, chains: impl IntoIterator<Item = ChainId>) -> Self {
        self.config.network.supported_chains = chains.into_iter().collect();
        self
    }

    /// Toggle conversation persistence through the storage service.
    pub fn persist_conversations(mut self, enabled: bool) -> Self {
        self.config.storage.persist_conversations = enabled;
        self
    }

    /// Finalize and return the built `EngineConfig`.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Bounded waits applied by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Wait before the first byte of a stream; covers cold model loads.
    #[serde(default = "default_first_chunk_timeout_ms")]
    pub first_chunk_timeout_ms: u64,
    #[serde(default = "default_inter_chunk_timeout_ms")]
    pub inter_chunk_timeout_ms: u64,
    /// Grace after a final chunk while waiting for the terminal message.
    #[serde(default = "default_final_grace_ms")]
    pub final_grace_ms: u64,
    /// Timeout for correlated auxiliary requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl TimeoutsConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn first_chunk(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }

    pub fn inter_chunk(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_timeout_ms)
    }

    pub fn final_grace(&self) -> Duration {
        Duration::from_millis(self.final_grace_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            first_chunk_timeout_ms: default_first_chunk_timeout_ms(),
            inter_chunk_timeout_ms: default_inter_chunk_timeout_ms(),
            final_grace_ms: default_final_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_first_chunk_timeout_ms() -> u64 {
    180_000
}

fn default_inter_chunk_timeout_ms() -> u64 {
    60_000
}

fn default_final_grace_ms() -> u64 {
    3_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Streaming response settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingConfig {
    /// Context utilization at or above which a warning event fires.
    #[serde(default = "default_context_warning_threshold")]
    pub context_warning_threshold: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            context_warning_threshold: default_context_warning_threshold(),
        }
    }
}

fn default_context_warning_threshold() -> f64 {
    0.8
}

/// When the engine re-runs the encrypted handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// Re-initialize before every logical operation group.
    #[default]
    PerOperation,
    /// Handshake once per connection.
    PerConnection,
}

/// End-to-end encryption settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub handshake_policy: HandshakePolicy,
    /// Lifetime of cached host public keys.
    #[serde(default = "default_host_key_cache_ttl_secs")]
    pub host_key_cache_ttl_secs: u64,
}

impl EncryptionConfig {
    pub fn host_key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.host_key_cache_ttl_secs)
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            handshake_policy: HandshakePolicy::default(),
            host_key_cache_ttl_secs: default_host_key_cache_ttl_secs(),
        }
    }
}

fn default_host_key_cache_ttl_secs() -> u64 {
    3_600
}

/// Vector upload and search bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RagConfig {
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: usize,
    #[serde(default = "default_upload_batch_size")]
    pub upload_batch_size: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            vector_dimension: default_vector_dimension(),
            upload_batch_size: default_upload_batch_size(),
            max_top_k: default_max_top_k(),
        }
    }
}

fn default_vector_dimension() -> usize {
    384
}

fn default_upload_batch_size() -> usize {
    1_000
}

fn default_max_top_k() -> usize {
    20
}

/// Chain allow-list; empty allows every chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub supported_chains: Vec<ChainId>,
}

/// Conversation persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub persist_conversations: bool,
}
