//! Host-signed checkpoint material for recovery tests.

use crate::services::{StubPaymentService, StubStorageService};
use chrono::Utc;
use meterlink_core::{
    CheckpointDelta, CheckpointEntry, CheckpointIndex, ConversationMessage, ProofSubmission,
    SignedCheckpointIndex,
};
use meterlink_crypto::{CryptoProvider, PublicKey, Secp256k1Crypto};
use meterlink_protocol::{JobId, SessionId};
use serde_json::{Value, json};

const TOKENS_PER_CHECKPOINT: u64 = 1_000;

/// Builds a checkpoint index, its deltas, and matching on-chain proofs,
/// all produced by a generated host identity.
pub struct CheckpointFixture {
    host: Secp256k1Crypto,
    pub session_id: SessionId,
    pub job_id: JobId,
    recovery_key: Option<PublicKey>,
    checkpoints: Vec<Vec<ConversationMessage>>,
}

impl CheckpointFixture {
    pub fn new(session_id: SessionId, job_id: JobId) -> Self {
        Self {
            host: Secp256k1Crypto::generate(),
            session_id,
            job_id,
            recovery_key: None,
            checkpoints: Vec::new(),
        }
    }

    /// Seal every delta to this recovery key.
    pub fn sealed_to(mut self, recovery_key: PublicKey) -> Self {
        self.recovery_key = Some(recovery_key);
        self
    }

    /// Append a checkpoint covering these messages.
    pub fn checkpoint(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.checkpoints.push(messages);
        self
    }

    /// Hex public key of the host identity.
    pub fn signer(&self) -> String {
        self.host.client_address()
    }

    pub fn proof_hash(index: u64) -> String {
        format!("0x{}", hex::encode([index as u8 + 1; 32]))
    }

    pub fn delta_cid(&self, index: u64) -> String {
        format!("bafy-delta-{}-{}", self.session_id, index)
    }

    pub fn index(&self) -> CheckpointIndex {
        CheckpointIndex {
            session_id: self.session_id,
            host_address: self.signer(),
            checkpoints: (0..self.checkpoints.len() as u64)
                .map(|index| CheckpointEntry {
                    index,
                    proof_hash: Self::proof_hash(index),
                    delta_cid: self.delta_cid(index),
                    token_range: [
                        index * TOKENS_PER_CHECKPOINT,
                        (index + 1) * TOKENS_PER_CHECKPOINT,
                    ],
                    timestamp: Utc::now().timestamp_millis(),
                })
                .collect(),
        }
    }

    /// Sign an index with the host identity.
    pub fn sign(&self, index: CheckpointIndex) -> SignedCheckpointIndex {
        let bytes = SignedCheckpointIndex::signing_bytes(&index).expect("index encodes");
        SignedCheckpointIndex {
            index,
            host_signature: format!("0x{}", hex::encode(self.host.sign(&bytes))),
        }
    }

    pub fn signed_index(&self) -> SignedCheckpointIndex {
        self.sign(self.index())
    }

    pub fn delta(&self, index: u64) -> CheckpointDelta {
        CheckpointDelta {
            session_id: self.session_id,
            checkpoint_index: index,
            proof_hash: Some(Self::proof_hash(index)),
            start_token: index * TOKENS_PER_CHECKPOINT,
            end_token: (index + 1) * TOKENS_PER_CHECKPOINT,
            messages: self.checkpoints[index as usize].clone(),
        }
    }

    /// Stored form of a delta: plain JSON, or an envelope sealed to the
    /// recovery key and signed by the host.
    pub fn delta_bytes(&self, index: u64) -> Vec<u8> {
        let plaintext = serde_json::to_vec(&self.delta(index)).expect("delta encodes");
        let Some(recovery_key) = self.recovery_key.as_ref() else {
            return plaintext;
        };
        let envelope = self
            .host
            .seal_for_host(recovery_key, &plaintext, b"checkpoint_delta")
            .expect("delta seals");
        let mut blob = serde_json::to_value(envelope.to_frame()).expect("frame encodes");
        if let Value::Object(fields) = &mut blob {
            fields.insert("encrypted".to_string(), json!(true));
        }
        serde_json::to_vec(&blob).expect("blob encodes")
    }

    pub fn proof(&self, index: u64) -> ProofSubmission {
        ProofSubmission {
            job_id: self.job_id,
            index,
            proof_hash: Self::proof_hash(index),
            delta_cid: Some(self.delta_cid(index)),
            tokens_claimed: TOKENS_PER_CHECKPOINT,
            block_number: 1_000 + index,
        }
    }

    /// Store every delta and record every proof, both as a point lookup and
    /// as a chain event. Returns the signed index.
    pub fn install(
        &self,
        storage: &StubStorageService,
        payment: &StubPaymentService,
    ) -> SignedCheckpointIndex {
        for index in 0..self.checkpoints.len() as u64 {
            storage.put_blob(self.delta_cid(index), self.delta_bytes(index));
            payment.insert_proof(self.proof(index));
            payment.push_event(self.proof(index));
        }
        self.signed_index()
    }
}
