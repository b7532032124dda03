//! Conversation recovery from checkpoint deltas.
//!
//! Two independent strategies rebuild a transcript: one trusts a host-signed
//! checkpoint index cross-checked against on-chain proofs, the other reads
//! proof submission events straight from the chain. Both fail closed: any
//! gap, mismatch, missing delta, or decryption failure aborts the call.

mod chain;
mod host;
mod http;

pub use http::HttpCheckpointSource;

pub(crate) use chain::recover_from_chain;
pub(crate) use host::recover_from_host;

use crate::error::{CollaboratorError, EngineError, RecoveryError};
use crate::services::{PaymentService, StorageService};
use crate::types::{ConversationMessage, Role};
use async_trait::async_trait;
use log::debug;
use meterlink_crypto::{CryptoProvider, SealedEnvelope};
use meterlink_protocol::{ChainId, JobId, SealedInitFrame, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One checkpoint as published by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub index: u64,
    pub proof_hash: String,
    pub delta_cid: String,
    /// Inclusive start and exclusive end of the tokens the checkpoint covers.
    pub token_range: [u64; 2],
    pub timestamp: i64,
}

/// Host-published list of checkpoints for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointIndex {
    pub session_id: SessionId,
    pub host_address: String,
    pub checkpoints: Vec<CheckpointEntry>,
}

/// Checkpoint index with the host's signature over its JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedCheckpointIndex {
    pub index: CheckpointIndex,
    /// Hex compact ECDSA signature over [`SignedCheckpointIndex::signing_bytes`].
    pub host_signature: String,
}

impl SignedCheckpointIndex {
    /// Bytes the host signs.
    pub fn signing_bytes(index: &CheckpointIndex) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(index)
    }
}

/// Conversation fragment covered by one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointDelta {
    pub session_id: SessionId,
    pub checkpoint_index: u64,
    /// Older hosts omit the proof hash from plaintext deltas.
    #[serde(default)]
    pub proof_hash: Option<String>,
    pub start_token: u64,
    pub end_token: u64,
    pub messages: Vec<ConversationMessage>,
}

/// Transcript rebuilt from checkpoint deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveredConversation {
    pub messages: Vec<ConversationMessage>,
    pub token_count: u64,
    pub checkpoint_count: usize,
}

/// Parameters for host-reported recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecoveryRequest {
    pub session_id: SessionId,
    pub job_id: JobId,
    /// Base URL of the host's HTTP query surface.
    pub host_url: String,
    /// Hex public key expected to have signed the index and deltas.
    pub expected_signer: String,
}

/// Parameters for blockchain-event recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRecoveryRequest {
    pub chain_id: ChainId,
    pub job_id: JobId,
}

/// Host query surface publishing checkpoint indexes.
#[async_trait]
pub trait CheckpointSource: Send + Sync {
    /// Signed index for a session, or `None` when the host has none.
    async fn fetch_index(
        &self,
        host_url: &str,
        session_id: SessionId,
    ) -> Result<Option<SignedCheckpointIndex>, CollaboratorError>;
}

/// Collaborators a recovery call reads from.
pub(crate) struct RecoveryDeps<'a> {
    pub crypto: &'a dyn CryptoProvider,
    pub payment: &'a dyn PaymentService,
    pub storage: &'a dyn StorageService,
}

/// Stored delta blob, either plaintext JSON or a sealed envelope.
pub(crate) enum DeltaBlob {
    Plain(CheckpointDelta),
    Sealed(SealedEnvelope),
}

impl DeltaBlob {
    pub(crate) fn parse(index: u64, bytes: &[u8]) -> Result<Self, RecoveryError> {
        let corrupt = |reason: String| RecoveryError::CorruptDelta { index, reason };
        let value: Value = serde_json::from_slice(bytes).map_err(|err| corrupt(err.to_string()))?;
        if value.get("encrypted").and_then(Value::as_bool) == Some(true) {
            let frame: SealedInitFrame =
                serde_json::from_value(value).map_err(|err| corrupt(err.to_string()))?;
            let envelope =
                SealedEnvelope::from_frame(&frame).map_err(|err| corrupt(err.to_string()))?;
            return Ok(DeltaBlob::Sealed(envelope));
        }
        let delta = serde_json::from_value(value).map_err(|err| corrupt(err.to_string()))?;
        Ok(DeltaBlob::Plain(delta))
    }

    /// Plaintext delta, opening sealed blobs with the recovery key.
    pub(crate) fn open(
        self,
        index: u64,
        crypto: &dyn CryptoProvider,
    ) -> Result<CheckpointDelta, RecoveryError> {
        match self {
            DeltaBlob::Plain(delta) => Ok(delta),
            DeltaBlob::Sealed(envelope) => {
                let plaintext = crypto
                    .open_with_recovery_key(&envelope)
                    .map_err(|err| {
                        debug!("delta decryption failed (index={}, err={})", index, err);
                        RecoveryError::DecryptionFailed { index }
                    })?;
                serde_json::from_slice(&plaintext).map_err(|err| RecoveryError::CorruptDelta {
                    index,
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// Fetch and open the delta stored under `cid`, checking its checkpoint index.
pub(crate) async fn load_delta(
    deps: &RecoveryDeps<'_>,
    index: u64,
    cid: &str,
    expected_session: Option<SessionId>,
    expected_signer: Option<&str>,
) -> Result<CheckpointDelta, EngineError> {
    let bytes = deps
        .storage
        .fetch_blob(cid)
        .await
        .map_err(EngineError::collaborator("storage"))?
        .ok_or_else(|| RecoveryError::MissingDelta {
            index,
            cid: Some(cid.to_string()),
        })?;
    let blob = DeltaBlob::parse(index, &bytes)?;
    if let (DeltaBlob::Sealed(envelope), Some(signer)) = (&blob, expected_signer) {
        deps.crypto
            .verify_signature(&envelope.ciphertext, &envelope.signature, signer)
            .map_err(|_| RecoveryError::SignatureMismatch {
                signer: signer.to_string(),
            })?;
    }
    let delta = blob.open(index, deps.crypto)?;
    if delta.checkpoint_index != index {
        return Err(RecoveryError::CorruptDelta {
            index,
            reason: format!("delta claims checkpoint {}", delta.checkpoint_index),
        }
        .into());
    }
    if let Some(expected) = expected_session
        && delta.session_id != expected
    {
        return Err(RecoveryError::CorruptDelta {
            index,
            reason: format!("delta belongs to session {}", delta.session_id),
        }
        .into());
    }
    Ok(delta)
}

/// Require indices `0, 1, 2, ...` with no gaps or repeats.
pub(crate) fn ensure_contiguous(indices: impl IntoIterator<Item = u64>) -> Result<(), RecoveryError> {
    for (expected, found) in (0u64..).zip(indices) {
        if expected != found {
            return Err(RecoveryError::SequenceGap { expected, found });
        }
    }
    Ok(())
}

/// Proof hashes compare case-insensitively, ignoring a `0x` prefix.
pub(crate) fn same_hash(left: &str, right: &str) -> bool {
    let strip = |value: &str| value.strip_prefix("0x").unwrap_or(value).to_ascii_lowercase();
    strip(left) == strip(right)
}

/// Append delta messages; partial assistant messages extend the previous one.
pub(crate) fn merge_messages(
    transcript: &mut Vec<ConversationMessage>,
    messages: Vec<ConversationMessage>,
) {
    for mut message in messages {
        if message.partial
            && message.role == Role::Assistant
            && let Some(previous) = transcript.last_mut()
            && previous.role == Role::Assistant
        {
            previous.content.push_str(&message.content);
            continue;
        }
        message.partial = false;
        transcript.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(role: Role, content: &str, partial: bool) -> ConversationMessage {
        ConversationMessage {
            role,
            content: content.to_string(),
            timestamp: 0,
            partial,
        }
    }

    #[test]
    fn partial_assistant_messages_are_stitched() {
        let mut transcript = vec![
            message(Role::User, "hi", false),
            message(Role::Assistant, "Hello, ", false),
        ];
        merge_messages(
            &mut transcript,
            vec![
                message(Role::Assistant, "world", true),
                message(Role::User, "again", false),
            ],
        );
        assert_eq!(
            transcript,
            vec![
                message(Role::User, "hi", false),
                message(Role::Assistant, "Hello, world", false),
                message(Role::User, "again", false),
            ]
        );
    }

    #[test]
    fn partial_message_without_predecessor_is_kept() {
        let mut transcript = Vec::new();
        merge_messages(&mut transcript, vec![message(Role::Assistant, "tail", true)]);
        assert_eq!(transcript, vec![message(Role::Assistant, "tail", false)]);
    }

    #[test]
    fn sequence_must_start_at_zero_without_gaps() {
        assert!(ensure_contiguous([0, 1, 2]).is_ok());
        assert!(ensure_contiguous(Vec::<u64>::new()).is_ok());
        assert!(matches!(
            ensure_contiguous([0, 2]),
            Err(RecoveryError::SequenceGap {
                expected: 1,
                found: 2
            })
        ));
        assert!(matches!(
            ensure_contiguous([0, 0]),
            Err(RecoveryError::SequenceGap { .. })
        ));
    }

    #[test]
    fn hashes_compare_loosely() {
        assert!(same_hash("0xABCD", "abcd"));
        assert!(!same_hash("0xabcd", "0xabce"));
    }

    #[test]
    fn garbage_blobs_are_corrupt() {
        assert!(matches!(
            DeltaBlob::parse(3, b"not json"),
            Err(RecoveryError::CorruptDelta { index: 3, .. })
        ));
        assert!(matches!(
            DeltaBlob::parse(1, br#"{"encrypted":true,"ciphertextHex":"zz"}"#),
            Err(RecoveryError::CorruptDelta { index: 1, .. })
        ));
    }
}
