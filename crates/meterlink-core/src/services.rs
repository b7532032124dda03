//! External collaborators consumed by the engine.
//!
//! Payment, storage, and host key lookup live outside the engine; these
//! traits are the seams. Implementations report failures as
//! [`CollaboratorError`] and the engine wraps them with the service name.

use crate::error::CollaboratorError;
use crate::types::{ConversationMessage, StoredConversation};
use async_trait::async_trait;
use meterlink_crypto::PublicKey;
use meterlink_protocol::{ChainId, JobId, SessionId};
use serde::{Deserialize, Serialize};

/// Parameters for allocating a session job on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub chain_id: ChainId,
    pub host_address: String,
    pub model: String,
    pub price_per_token: u64,
    pub deposit: u64,
    pub proof_interval: u64,
    pub duration_secs: u64,
}

/// Identifiers returned by a successful job allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobAllocation {
    pub session_id: SessionId,
    pub job_id: JobId,
}

/// Acknowledgment of a submitted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointReceipt {
    pub checkpoint: u64,
    pub tx_hash: Option<String>,
}

/// Acknowledgment of final settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub total_tokens: u64,
    pub tx_hash: Option<String>,
}

/// Proof submission recorded on chain for one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofSubmission {
    pub job_id: JobId,
    /// Checkpoint index the proof covers.
    pub index: u64,
    pub proof_hash: String,
    /// Content reference of the conversation delta, when the event carries one.
    #[serde(default)]
    pub delta_cid: Option<String>,
    pub tokens_claimed: u64,
    pub block_number: u64,
}

/// On-chain job creation, checkpointing, settlement, and proof queries.
#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn create_session_job(
        &self,
        request: &JobRequest,
    ) -> Result<JobAllocation, CollaboratorError>;

    async fn submit_checkpoint(
        &self,
        session_id: SessionId,
        job_id: JobId,
        token_count: u64,
    ) -> Result<CheckpointReceipt, CollaboratorError>;

    async fn complete_session(
        &self,
        session_id: SessionId,
        job_id: JobId,
        total_tokens: u64,
    ) -> Result<SettlementReceipt, CollaboratorError>;

    /// Proof recorded for a checkpoint, if any.
    async fn get_proof_submission(
        &self,
        job_id: JobId,
        index: u64,
    ) -> Result<Option<ProofSubmission>, CollaboratorError>;

    /// Every proof submission event for a job, in chain order.
    async fn proof_submission_events(
        &self,
        chain_id: ChainId,
        job_id: JobId,
    ) -> Result<Vec<ProofSubmission>, CollaboratorError>;
}

/// Conversation persistence and content-addressed blob access.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Store a whole conversation; returns its content reference.
    async fn store_conversation(
        &self,
        conversation: &StoredConversation,
    ) -> Result<String, CollaboratorError>;

    async fn append_message(
        &self,
        session_id: SessionId,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError>;

    async fn load_conversation(
        &self,
        session_id: SessionId,
    ) -> Result<Option<StoredConversation>, CollaboratorError>;

    /// Fetch a blob by content reference.
    async fn fetch_blob(&self, cid: &str) -> Result<Option<Vec<u8>>, CollaboratorError>;
}

/// Host public key lookup.
#[async_trait]
pub trait HostKeyDirectory: Send + Sync {
    async fn host_public_key(
        &self,
        host_address: &str,
    ) -> Result<Option<PublicKey>, CollaboratorError>;
}
