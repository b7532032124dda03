//! Session engine facade.
//!
//! [`SessionEngine`] ties the session store, the connection pool, the pending
//! request registry, and the external collaborators together. Operations are
//! split by concern: lifecycle, prompting, RAG, and recovery.

mod lifecycle;
mod prompt;
mod rag;
mod recovery;

use crate::error::EngineError;
use crate::host_keys::CachedHostKeys;
use crate::pending::PendingRegistry;
use crate::recovery::{CheckpointSource, HttpCheckpointSource};
use crate::services::{HostKeyDirectory, PaymentService, StorageService};
use crate::store::SessionStore;
use crate::transport::{Connection, ConnectionLease, ConnectionPool, TransportConnector};
use crate::types::{SessionRecord, StoredConversation};
use log::{debug, info, warn};
use meterlink_config::{EngineConfig, HandshakePolicy};
use meterlink_crypto::{CryptoProvider, SESSION_INIT_AAD};
use meterlink_protocol::{
    ClientMessage, EventSink, HostMessage, NullSink, SessionId, SessionInitPayload, SessionStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use zeroize::{Zeroize, Zeroizing};

/// External services handed to [`SessionEngine::new`].
///
/// Payment, storage, crypto, host keys, and the transport connector are
/// required. Without a checkpoint source, host recovery reads the host's
/// HTTP surface; without an event sink, events are dropped.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub payment: Option<Arc<dyn PaymentService>>,
    pub storage: Option<Arc<dyn StorageService>>,
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    pub host_keys: Option<Arc<dyn HostKeyDirectory>>,
    pub host_key_fallback: Option<Arc<dyn HostKeyDirectory>>,
    pub connector: Option<Arc<dyn TransportConnector>>,
    pub checkpoint_source: Option<Arc<dyn CheckpointSource>>,
    pub event_sink: Option<Arc<dyn EventSink>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payment(mut self, payment: Arc<dyn PaymentService>) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_host_keys(mut self, host_keys: Arc<dyn HostKeyDirectory>) -> Self {
        self.host_keys = Some(host_keys);
        self
    }

    /// Directory consulted when the primary has no key for a host.
    pub fn with_host_key_fallback(mut self, fallback: Arc<dyn HostKeyDirectory>) -> Self {
        self.host_key_fallback = Some(fallback);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_checkpoint_source(mut self, source: Arc<dyn CheckpointSource>) -> Self {
        self.checkpoint_source = Some(source);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

/// Client side of pay-per-token inference sessions.
pub struct SessionEngine {
    config: EngineConfig,
    store: SessionStore,
    pending: Arc<PendingRegistry>,
    pool: ConnectionPool,
    crypto: Arc<dyn CryptoProvider>,
    payment: Arc<dyn PaymentService>,
    storage: Arc<dyn StorageService>,
    host_keys: CachedHostKeys,
    checkpoint_source: Arc<dyn CheckpointSource>,
    sink: Arc<dyn EventSink>,
    stream_tokens: Mutex<HashMap<SessionId, CancellationToken>>,
    /// Cancelled by teardown and kept, so later prompts see the end too.
    end_tokens: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl SessionEngine {
    /// Validate the config and collaborators. Performs no network I/O.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        let Collaborators {
            payment,
            storage,
            crypto,
            host_keys,
            host_key_fallback,
            connector,
            checkpoint_source,
            event_sink,
        } = collaborators;
        let payment = payment.ok_or(EngineError::MissingCollaborator("payment"))?;
        let storage = storage.ok_or(EngineError::MissingCollaborator("storage"))?;
        let crypto = crypto.ok_or(EngineError::MissingCollaborator("crypto"))?;
        let host_keys = host_keys.ok_or(EngineError::MissingCollaborator("host_keys"))?;
        let connector = connector.ok_or(EngineError::MissingCollaborator("connector"))?;
        let checkpoint_source: Arc<dyn CheckpointSource> = match checkpoint_source {
            Some(source) => source,
            None => Arc::new(
                HttpCheckpointSource::new(config.timeouts.request())
                    .map_err(EngineError::collaborator("checkpoint source"))?,
            ),
        };
        let sink = event_sink.unwrap_or_else(|| Arc::new(NullSink));

        let pending = Arc::new(PendingRegistry::new());
        let host_keys = CachedHostKeys::new(
            host_keys,
            host_key_fallback,
            config.encryption.host_key_cache_ttl(),
        );
        info!(
            "session engine ready (handshake_policy={:?}, supported_chains={})",
            config.encryption.handshake_policy,
            config.network.supported_chains.len()
        );
        Ok(Self {
            store: SessionStore::new(sink.clone()),
            pool: ConnectionPool::new(connector, pending.clone()),
            pending,
            crypto,
            payment,
            storage,
            host_keys,
            checkpoint_source,
            sink,
            stream_tokens: Mutex::new(HashMap::new()),
            end_tokens: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of one session record.
    pub fn session(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        self.store.get(session_id)
    }

    /// Snapshots of every known session, newest first.
    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        self.store.list()
    }

    /// Conversation persisted for a session, if the storage service has one.
    pub async fn load_conversation(
        &self,
        session_id: SessionId,
    ) -> Result<Option<StoredConversation>, EngineError> {
        self.storage
            .load_conversation(session_id)
            .await
            .map_err(EngineError::collaborator("storage"))
    }

    /// Token that cancels the session's in-flight stream, or the next one if
    /// none is running.
    pub fn cancel_handle(&self, session_id: SessionId) -> Result<CancellationToken, EngineError> {
        self.store.get(session_id)?;
        Ok(self.stream_token(session_id))
    }

    fn stream_token(&self, session_id: SessionId) -> CancellationToken {
        self.stream_tokens
            .lock()
            .entry(session_id)
            .or_default()
            .clone()
    }

    fn clear_stream_token(&self, session_id: SessionId) {
        self.stream_tokens.lock().remove(&session_id);
    }

    fn end_token(&self, session_id: SessionId) -> CancellationToken {
        self.end_tokens
            .lock()
            .entry(session_id)
            .or_default()
            .clone()
    }

    /// Lease the session's connection and bring it to a usable state:
    /// rebound to this session, handshaken per policy. A `Pending` session
    /// becomes `Active` once its handshake succeeds.
    async fn prepare(
        &self,
        session_id: SessionId,
    ) -> Result<(SessionRecord, ConnectionLease), EngineError> {
        let record = self.store.require_operable(session_id)?;
        let mut lease = self.pool.lease(&record.endpoint, session_id).await?;
        let record = self.store.require_operable(session_id)?;
        self.ensure_handshake(&record, &mut lease).await?;
        let record = if record.status == SessionStatus::Pending {
            self.store.transition(session_id, SessionStatus::Active)?
        } else {
            record
        };
        Ok((record, lease))
    }

    async fn ensure_handshake(
        &self,
        record: &SessionRecord,
        connection: &mut Connection,
    ) -> Result<(), EngineError> {
        if record.encryption_enabled {
            let needed = match self.config.encryption.handshake_policy {
                HandshakePolicy::PerOperation => true,
                HandshakePolicy::PerConnection => !connection.encryption.is_ready(),
            };
            if needed {
                self.encrypted_handshake(record, connection).await?;
            }
        } else if !connection.initialized {
            self.plain_handshake(record, connection).await?;
        }
        Ok(())
    }

    async fn encrypted_handshake(
        &self,
        record: &SessionRecord,
        connection: &mut Connection,
    ) -> Result<(), EngineError> {
        let host_key = self.host_keys.resolve(&record.provider).await?;
        let key = self.crypto.generate_session_key();
        let mut payload = SessionInitPayload {
            session_key_hex: key.to_hex().to_string(),
            job_id: record.job_id.to_string(),
            model_name: record.model.clone(),
            price_per_token: record.price_per_token,
            client_address: self.crypto.client_address(),
        };
        let plaintext = serde_json::to_vec(&payload).map(Zeroizing::new);
        payload.session_key_hex.zeroize();
        let plaintext = plaintext?;
        let envelope = self
            .crypto
            .seal_for_host(&host_key, &plaintext, SESSION_INIT_AAD)?;

        connection.encryption.begin(key);
        let ack = connection.arm_handshake();
        let init = ClientMessage::EncryptedSessionInit {
            session_id: record.session_id,
            job_id: record.job_id,
            chain_id: record.chain_id,
            payload: envelope.to_frame(),
        };
        let outcome = match connection.send(&init) {
            Ok(()) => self.await_ack(record.session_id, ack).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                connection.encryption.acknowledge();
                info!(
                    "encrypted handshake complete (session_id={}, host={})",
                    record.session_id, record.provider
                );
                Ok(())
            }
            Err(err) => {
                connection.encryption.abort();
                connection.disarm_handshake();
                if matches!(err, EngineError::SessionInit(_)) {
                    self.host_keys.invalidate(&record.provider);
                }
                warn!(
                    "encrypted handshake failed (session_id={}, err={})",
                    record.session_id, err
                );
                Err(err)
            }
        }
    }

    async fn plain_handshake(
        &self,
        record: &SessionRecord,
        connection: &mut Connection,
    ) -> Result<(), EngineError> {
        let ack = connection.arm_handshake();
        let init = ClientMessage::SessionInit {
            session_id: record.session_id,
            job_id: record.job_id,
            chain_id: record.chain_id,
            model: record.model.clone(),
            price_per_token: Some(record.price_per_token),
        };
        let outcome = match connection.send(&init) {
            Ok(()) => self.await_ack(record.session_id, ack).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            connection.disarm_handshake();
            warn!(
                "handshake failed (session_id={}, err={})",
                record.session_id, err
            );
            return Err(err);
        }
        connection.initialized = true;
        debug!("plaintext handshake complete (session_id={})", record.session_id);
        Ok(())
    }

    async fn await_ack(
        &self,
        session_id: SessionId,
        ack: oneshot::Receiver<HostMessage>,
    ) -> Result<(), EngineError> {
        let timeout = self.config.timeouts.handshake();
        let message = match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                return Err(EngineError::Transport(
                    "connection closed during handshake".to_string(),
                ));
            }
            Err(_) => {
                return Err(EngineError::TransportTimeout {
                    operation: "handshake",
                    after_ms: timeout.as_millis() as u64,
                });
            }
        };
        match message {
            HostMessage::SessionInitAck {
                status, message, ..
            } => match status.as_deref() {
                Some(status) if is_rejection(status) => Err(EngineError::SessionInit(
                    message.unwrap_or_else(|| format!("host answered {status}")),
                )),
                _ => Ok(()),
            },
            HostMessage::Error { code, message, .. } => Err(EngineError::SessionInit(format!(
                "{}: {}",
                code.as_deref().unwrap_or("UNKNOWN"),
                message.as_deref().unwrap_or("host rejected the session")
            ))),
            other => {
                debug!(
                    "unexpected handshake reply (session_id={}, type={})",
                    session_id,
                    other.type_name()
                );
                Err(EngineError::UnexpectedResponse(other.type_name().to_string()))
            }
        }
    }
}

fn is_rejection(status: &str) -> bool {
    ["error", "failed", "rejected"]
        .iter()
        .any(|rejected| status.eq_ignore_ascii_case(rejected))
}
