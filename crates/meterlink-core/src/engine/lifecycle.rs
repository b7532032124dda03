use super::SessionEngine;
use crate::error::EngineError;
use crate::pending::FailReason;
use crate::services::{CheckpointReceipt, JobRequest, SettlementReceipt};
use crate::store::NewSession;
use crate::types::{SessionRecord, StartSessionRequest, StoredConversation};
use chrono::Utc;
use log::{debug, error, info, warn};
use meterlink_protocol::{EventMsg, EventPayload, SessionId, SessionStatus};

impl SessionEngine {
    /// Allocate a job, create the record, connect, and handshake.
    ///
    /// The record is created `Pending` once the payment service allocates a
    /// job and only becomes `Active` after the handshake succeeds. A transport
    /// or handshake failure leaves it `Pending`, so the next operation
    /// retries the handshake.
    pub async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> Result<SessionRecord, EngineError> {
        if !self.config.supports_chain(request.chain_id) {
            return Err(EngineError::UnsupportedChain(request.chain_id));
        }
        let allocation = self
            .payment
            .create_session_job(&JobRequest {
                chain_id: request.chain_id,
                host_address: request.host_address.clone(),
                model: request.model.clone(),
                price_per_token: request.price_per_token,
                deposit: request.deposit,
                proof_interval: request.proof_interval,
                duration_secs: request.duration_secs,
            })
            .await
            .map_err(EngineError::collaborator("payment"))?;
        let session_id = allocation.session_id;

        self.store.create(NewSession {
            session_id,
            job_id: allocation.job_id,
            chain_id: request.chain_id,
            model: request.model,
            provider: request.host_address,
            endpoint: request.endpoint,
            price_per_token: request.price_per_token,
            encryption_enabled: request.encryption,
        });
        if let Some(vector_db_id) = request.vector_database.as_deref() {
            self.store.attach_rag(session_id, vector_db_id)?;
        }

        let (record, lease) = self.prepare(session_id).await?;
        drop(lease);

        if self.config.storage.persist_conversations {
            let conversation = StoredConversation {
                session_id,
                messages: Vec::new(),
                updated_at: Utc::now(),
            };
            match self.storage.store_conversation(&conversation).await {
                Ok(cid) => debug!("conversation stored (session_id={}, cid={})", session_id, cid),
                Err(err) => warn!(
                    "failed to store conversation (session_id={}, err={})",
                    session_id, err
                ),
            }
        }
        info!(
            "session started (session_id={}, job_id={}, encrypted={})",
            session_id, record.job_id, record.encryption_enabled
        );
        Ok(record)
    }

    pub fn pause_session(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        self.store.transition(session_id, SessionStatus::Paused)
    }

    pub fn resume_session(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        let record = self.store.get(session_id)?;
        if record.status != SessionStatus::Paused {
            return Err(EngineError::InvalidState {
                current: record.status,
                requested: SessionStatus::Active,
            });
        }
        self.store.transition(session_id, SessionStatus::Active)
    }

    /// Report the session's running token count to the payment service.
    pub async fn submit_checkpoint(
        &self,
        session_id: SessionId,
    ) -> Result<CheckpointReceipt, EngineError> {
        let record = self.store.get(session_id)?;
        if !matches!(record.status, SessionStatus::Active | SessionStatus::Paused) {
            return Err(EngineError::InvalidState {
                current: record.status,
                requested: SessionStatus::Active,
            });
        }
        let receipt = self
            .payment
            .submit_checkpoint(session_id, record.job_id, record.total_tokens)
            .await
            .map_err(EngineError::collaborator("payment"))?;
        self.store.record_checkpoint(session_id, receipt.checkpoint)?;
        self.sink.emit(EventMsg::new(
            session_id,
            EventPayload::CheckpointSubmitted {
                checkpoint: receipt.checkpoint,
                token_count: record.total_tokens,
            },
        ));
        info!(
            "checkpoint submitted (session_id={}, checkpoint={}, token_count={})",
            session_id, receipt.checkpoint, record.total_tokens
        );
        Ok(receipt)
    }

    /// Settle the final token count, tear down, and move to `Completed`.
    pub async fn complete_session(
        &self,
        session_id: SessionId,
    ) -> Result<SettlementReceipt, EngineError> {
        let record = self.store.get(session_id)?;
        if !matches!(record.status, SessionStatus::Active | SessionStatus::Paused) {
            return Err(EngineError::InvalidState {
                current: record.status,
                requested: SessionStatus::Completed,
            });
        }
        let receipt = self
            .payment
            .complete_session(session_id, record.job_id, record.total_tokens)
            .await
            .map_err(EngineError::collaborator("payment"))?;
        self.teardown(&record).await;
        self.store.transition(session_id, SessionStatus::Completed)?;
        info!(
            "session completed (session_id={}, total_tokens={})",
            session_id, receipt.total_tokens
        );
        Ok(receipt)
    }

    /// Cancel any stream, reject outstanding requests with `SessionEnded`,
    /// close the connection, and move to `Ended`.
    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        let record = self.store.get(session_id)?;
        if record.status.is_terminal() {
            return Err(EngineError::InvalidState {
                current: record.status,
                requested: SessionStatus::Ended,
            });
        }
        self.teardown(&record).await;
        self.store.transition(session_id, SessionStatus::Ended)
    }

    /// Tear down and move to `Failed`.
    pub async fn fail_session(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<SessionRecord, EngineError> {
        let record = self.store.get(session_id)?;
        if record.status.is_terminal() {
            return Err(EngineError::InvalidState {
                current: record.status,
                requested: SessionStatus::Failed,
            });
        }
        error!("session failed (session_id={}, reason={})", session_id, reason);
        self.teardown(&record).await;
        self.store.transition(session_id, SessionStatus::Failed)
    }

    /// Cancel the stream first so an in-flight prompt gives up its lease
    /// before the connection is released.
    async fn teardown(&self, record: &SessionRecord) {
        let session_id = record.session_id;
        self.end_token(session_id).cancel();
        if let Some(token) = self.stream_tokens.lock().remove(&session_id) {
            token.cancel();
        }
        let rejected = self.pending.fail_session(session_id, FailReason::SessionEnded);
        let released = self.pool.release(&record.endpoint, session_id).await;
        debug!(
            "session torn down (session_id={}, rejected={}, released={})",
            session_id, rejected, released
        );
    }
}
