//! In-memory collaborators recording every call.

use async_trait::async_trait;
use meterlink_core::{
    CheckpointReceipt, CheckpointSource, CollaboratorError, ConversationMessage, HostKeyDirectory,
    JobAllocation, JobRequest, PaymentService, ProofSubmission, SettlementReceipt,
    SignedCheckpointIndex, StorageService, StoredConversation,
};
use meterlink_crypto::PublicKey;
use meterlink_protocol::{ChainId, JobId, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Payment stub: sequential session ids, job id `100 + session id`.
#[derive(Default)]
pub struct StubPaymentService {
    next_session: AtomicU64,
    fail_create: AtomicBool,
    jobs: Mutex<Vec<JobRequest>>,
    checkpoints: Mutex<Vec<(SessionId, JobId, u64)>>,
    settlements: Mutex<Vec<(SessionId, JobId, u64)>>,
    proofs: Mutex<HashMap<(JobId, u64), ProofSubmission>>,
    events: Mutex<Vec<ProofSubmission>>,
}

impl StubPaymentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_job_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn job_requests(&self) -> Vec<JobRequest> {
        self.jobs.lock().clone()
    }

    /// `(session, job, token_count)` per submitted checkpoint.
    pub fn checkpoints(&self) -> Vec<(SessionId, JobId, u64)> {
        self.checkpoints.lock().clone()
    }

    pub fn settlements(&self) -> Vec<(SessionId, JobId, u64)> {
        self.settlements.lock().clone()
    }

    /// Record a proof returned by `get_proof_submission`.
    pub fn insert_proof(&self, proof: ProofSubmission) {
        self.proofs.lock().insert((proof.job_id, proof.index), proof);
    }

    /// Record a proof submission event.
    pub fn push_event(&self, proof: ProofSubmission) {
        self.events.lock().push(proof);
    }
}

#[async_trait]
impl PaymentService for StubPaymentService {
    async fn create_session_job(
        &self,
        request: &JobRequest,
    ) -> Result<JobAllocation, CollaboratorError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("insufficient deposit"));
        }
        self.jobs.lock().push(request.clone());
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(JobAllocation {
            session_id: SessionId(session),
            job_id: JobId(100 + session),
        })
    }

    async fn submit_checkpoint(
        &self,
        session_id: SessionId,
        job_id: JobId,
        token_count: u64,
    ) -> Result<CheckpointReceipt, CollaboratorError> {
        let mut checkpoints = self.checkpoints.lock();
        checkpoints.push((session_id, job_id, token_count));
        Ok(CheckpointReceipt {
            checkpoint: checkpoints.len() as u64 - 1,
            tx_hash: Some(format!("0xcheckpoint{}", checkpoints.len())),
        })
    }

    async fn complete_session(
        &self,
        session_id: SessionId,
        job_id: JobId,
        total_tokens: u64,
    ) -> Result<SettlementReceipt, CollaboratorError> {
        self.settlements
            .lock()
            .push((session_id, job_id, total_tokens));
        Ok(SettlementReceipt {
            total_tokens,
            tx_hash: Some("0xsettled".to_string()),
        })
    }

    async fn get_proof_submission(
        &self,
        job_id: JobId,
        index: u64,
    ) -> Result<Option<ProofSubmission>, CollaboratorError> {
        Ok(self.proofs.lock().get(&(job_id, index)).cloned())
    }

    async fn proof_submission_events(
        &self,
        _chain_id: ChainId,
        job_id: JobId,
    ) -> Result<Vec<ProofSubmission>, CollaboratorError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// Storage stub holding conversations, appended messages, and blobs.
#[derive(Default)]
pub struct StubStorageService {
    conversations: Mutex<HashMap<SessionId, StoredConversation>>,
    appended: Mutex<Vec<(SessionId, ConversationMessage)>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl StubStorageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, cid: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.lock().insert(cid.into(), bytes);
    }

    pub fn remove_blob(&self, cid: &str) {
        self.blobs.lock().remove(cid);
    }

    pub fn appended(&self) -> Vec<(SessionId, ConversationMessage)> {
        self.appended.lock().clone()
    }

    pub fn stored(&self, session_id: SessionId) -> Option<StoredConversation> {
        self.conversations.lock().get(&session_id).cloned()
    }
}

#[async_trait]
impl StorageService for StubStorageService {
    async fn store_conversation(
        &self,
        conversation: &StoredConversation,
    ) -> Result<String, CollaboratorError> {
        self.conversations
            .lock()
            .insert(conversation.session_id, conversation.clone());
        Ok(format!("bafy-conversation-{}", conversation.session_id))
    }

    async fn append_message(
        &self,
        session_id: SessionId,
        message: &ConversationMessage,
    ) -> Result<(), CollaboratorError> {
        self.appended.lock().push((session_id, message.clone()));
        if let Some(conversation) = self.conversations.lock().get_mut(&session_id) {
            conversation.messages.push(message.clone());
        }
        Ok(())
    }

    async fn load_conversation(
        &self,
        session_id: SessionId,
    ) -> Result<Option<StoredConversation>, CollaboratorError> {
        Ok(self.conversations.lock().get(&session_id).cloned())
    }

    async fn fetch_blob(&self, cid: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        Ok(self.blobs.lock().get(cid).cloned())
    }
}

/// Host key directory backed by a fixed map.
#[derive(Default)]
pub struct StaticHostKeys {
    keys: Mutex<HashMap<String, PublicKey>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticHostKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, host_address: &str, key: PublicKey) -> Self {
        self.insert(host_address, key);
        self
    }

    pub fn insert(&self, host_address: &str, key: PublicKey) {
        self.keys.lock().insert(host_address.to_ascii_lowercase(), key);
    }

    /// Answer every lookup with an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostKeyDirectory for StaticHostKeys {
    async fn host_public_key(
        &self,
        host_address: &str,
    ) -> Result<Option<PublicKey>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new("registry unreachable"));
        }
        Ok(self
            .keys
            .lock()
            .get(&host_address.to_ascii_lowercase())
            .copied())
    }
}

/// Checkpoint source serving indexes from memory.
#[derive(Default)]
pub struct StubCheckpointSource {
    indexes: Mutex<HashMap<SessionId, SignedCheckpointIndex>>,
    requested_urls: Mutex<Vec<String>>,
}

impl StubCheckpointSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, index: SignedCheckpointIndex) {
        self.indexes.lock().insert(index.index.session_id, index);
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requested_urls.lock().clone()
    }
}

#[async_trait]
impl CheckpointSource for StubCheckpointSource {
    async fn fetch_index(
        &self,
        host_url: &str,
        session_id: SessionId,
    ) -> Result<Option<SignedCheckpointIndex>, CollaboratorError> {
        self.requested_urls.lock().push(host_url.to_string());
        Ok(self.indexes.lock().get(&session_id).cloned())
    }
}
