//! In-memory session registry and lifecycle state machine.

use crate::error::EngineError;
use crate::types::{RagContext, SessionRecord};
use chrono::Utc;
use log::{debug, info};
use meterlink_protocol::{
    ChainId, EventMsg, EventPayload, EventSink, JobId, SessionId, SessionStatus, UsageReport,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Fields captured when a session record is first created.
#[derive(Debug, Clone)]
pub(crate) struct NewSession {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub chain_id: ChainId,
    pub model: String,
    pub provider: String,
    pub endpoint: String,
    pub price_per_token: u64,
    pub encryption_enabled: bool,
}

/// Owns every [`SessionRecord`]; all mutation goes through here.
#[derive(Clone)]
pub(crate) struct SessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
    sink: Arc<dyn EventSink>,
}

/// Whether the lifecycle permits moving from `from` to `to`.
fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Pending, Active | Failed | Ended) | (Active | Paused, Completed | Failed | Ended)
            | (Active, Paused)
            | (Paused, Active)
    )
}

impl SessionStore {
    pub(crate) fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sink,
        }
    }

    /// Insert a fresh record in `Pending`.
    pub(crate) fn create(&self, new: NewSession) -> SessionRecord {
        let now = Utc::now();
        let record = SessionRecord {
            session_id: new.session_id,
            job_id: new.job_id,
            chain_id: new.chain_id,
            model: new.model,
            provider: new.provider,
            endpoint: new.endpoint,
            status: SessionStatus::Pending,
            price_per_token: new.price_per_token,
            encryption_enabled: new.encryption_enabled,
            prompts: Vec::new(),
            responses: Vec::new(),
            total_tokens: 0,
            last_token_usage: None,
            context_window_size: None,
            last_finish_reason: None,
            rag_context: None,
            last_checkpoint: None,
            created_at: now,
            updated_at: now,
        };
        info!(
            "session created (session_id={}, job_id={}, chain_id={})",
            record.session_id, record.job_id, record.chain_id
        );
        self.sessions.write().insert(record.session_id, record.clone());
        record
    }

    pub(crate) fn get(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(EngineError::UnknownSession(session_id))
    }

    /// Snapshots of every record, newest first.
    pub(crate) fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.sessions.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Apply a lifecycle transition and emit `StatusChanged`.
    pub(crate) fn transition(
        &self,
        session_id: SessionId,
        to: SessionStatus,
    ) -> Result<SessionRecord, EngineError> {
        let (from, snapshot) = {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get_mut(&session_id)
                .ok_or(EngineError::UnknownSession(session_id))?;
            let from = record.status;
            if !transition_allowed(from, to) {
                return Err(EngineError::InvalidState {
                    current: from,
                    requested: to,
                });
            }
            record.status = to;
            record.updated_at = Utc::now();
            (from, record.clone())
        };
        info!(
            "session status changed (session_id={}, from={}, to={})",
            session_id, from, to
        );
        self.sink.emit(EventMsg::new(
            session_id,
            EventPayload::StatusChanged { from, to },
        ));
        Ok(snapshot)
    }

    /// Fail unless the session can carry prompt or RAG traffic. `Pending`
    /// sessions qualify; the caller re-attempts their handshake.
    pub(crate) fn require_operable(&self, session_id: SessionId) -> Result<SessionRecord, EngineError> {
        let record = self.get(session_id)?;
        match record.status {
            SessionStatus::Active | SessionStatus::Pending => Ok(record),
            current => Err(EngineError::InvalidState {
                current,
                requested: SessionStatus::Active,
            }),
        }
    }

    /// Record a prompt and its (possibly partial) response.
    pub(crate) fn append_exchange(
        &self,
        session_id: SessionId,
        prompt: &str,
        response: &str,
    ) -> Result<(), EngineError> {
        self.update(session_id, |record| {
            record.prompts.push(prompt.to_string());
            record.responses.push(response.to_string());
        })
    }

    /// Fold a usage report into the running totals.
    pub(crate) fn apply_usage(
        &self,
        session_id: SessionId,
        usage: &UsageReport,
    ) -> Result<SessionRecord, EngineError> {
        self.update(session_id, |record| {
            record.total_tokens = record.total_tokens.saturating_add(usage.total_tokens);
            if usage.context_window_size.is_some() {
                record.context_window_size = usage.context_window_size;
            }
            if usage.finish_reason.is_some() {
                record.last_finish_reason = usage.finish_reason.clone();
            }
            record.last_token_usage = Some(usage.clone());
        })?;
        let record = self.get(session_id)?;
        debug!(
            "usage applied (session_id={}, delta={}, total_tokens={})",
            session_id, usage.total_tokens, record.total_tokens
        );
        Ok(record)
    }

    /// Bind a vector database. Re-attaching the same id is a no-op.
    pub(crate) fn attach_rag(
        &self,
        session_id: SessionId,
        vector_db_id: &str,
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(&session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        match &record.rag_context {
            Some(existing) if existing.vector_db_id == vector_db_id => Ok(()),
            Some(existing) => Err(EngineError::RagAlreadyAttached {
                session_id,
                existing: existing.vector_db_id.clone(),
            }),
            None => {
                debug!(
                    "vector database attached (session_id={}, vector_db_id={})",
                    session_id, vector_db_id
                );
                record.rag_context = Some(RagContext {
                    vector_db_id: vector_db_id.to_string(),
                });
                record.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    pub(crate) fn record_checkpoint(
        &self,
        session_id: SessionId,
        checkpoint: u64,
    ) -> Result<(), EngineError> {
        self.update(session_id, |record| record.last_checkpoint = Some(checkpoint))
    }

    fn update(
        &self,
        session_id: SessionId,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write();
        let record = sessions
            .get_mut(&session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}
