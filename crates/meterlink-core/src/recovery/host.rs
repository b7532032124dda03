use super::{
    CheckpointSource, HostRecoveryRequest, RecoveredConversation, RecoveryDeps, SignedCheckpointIndex,
    ensure_contiguous, load_delta, merge_messages, same_hash,
};
use crate::error::{EngineError, RecoveryError};
use log::{debug, info};

/// Rebuild a conversation from the host's signed checkpoint index.
pub(crate) async fn recover_from_host(
    deps: &RecoveryDeps<'_>,
    source: &dyn CheckpointSource,
    request: &HostRecoveryRequest,
) -> Result<RecoveredConversation, EngineError> {
    let signed = source
        .fetch_index(&request.host_url, request.session_id)
        .await
        .map_err(EngineError::collaborator("checkpoint source"))?
        .ok_or(RecoveryError::IndexUnavailable {
            session_id: request.session_id,
        })?;

    let signature = hex::decode(
        signed
            .host_signature
            .strip_prefix("0x")
            .unwrap_or(&signed.host_signature),
    )
    .map_err(|_| RecoveryError::SignatureMismatch {
        signer: request.expected_signer.clone(),
    })?;
    let signing_bytes = SignedCheckpointIndex::signing_bytes(&signed.index)?;
    deps.crypto
        .verify_signature(&signing_bytes, &signature, &request.expected_signer)
        .map_err(|_| RecoveryError::SignatureMismatch {
            signer: request.expected_signer.clone(),
        })?;
    debug!(
        "checkpoint index verified (session_id={}, checkpoints={})",
        request.session_id,
        signed.index.checkpoints.len()
    );

    let mut entries = signed.index.checkpoints;
    entries.sort_by_key(|entry| entry.index);
    ensure_contiguous(entries.iter().map(|entry| entry.index))?;

    let mut messages = Vec::new();
    let mut token_count = 0;
    for entry in &entries {
        let proof = deps
            .payment
            .get_proof_submission(request.job_id, entry.index)
            .await
            .map_err(EngineError::collaborator("payment"))?;
        let on_chain = proof.map(|proof| proof.proof_hash);
        if !on_chain
            .as_deref()
            .is_some_and(|hash| same_hash(hash, &entry.proof_hash))
        {
            return Err(RecoveryError::ProofHashMismatch {
                index: entry.index,
                expected: entry.proof_hash.clone(),
                actual: on_chain,
            }
            .into());
        }

        let delta = load_delta(
            deps,
            entry.index,
            &entry.delta_cid,
            Some(request.session_id),
            Some(&request.expected_signer),
        )
        .await?;
        if let Some(hash) = delta.proof_hash.as_deref()
            && !same_hash(hash, &entry.proof_hash)
        {
            return Err(RecoveryError::ProofHashMismatch {
                index: entry.index,
                expected: entry.proof_hash.clone(),
                actual: Some(hash.to_string()),
            }
            .into());
        }
        merge_messages(&mut messages, delta.messages);
        token_count = entry.token_range[1];
    }

    info!(
        "conversation recovered from host (session_id={}, checkpoints={}, messages={})",
        request.session_id,
        entries.len(),
        messages.len()
    );
    Ok(RecoveredConversation {
        messages,
        token_count,
        checkpoint_count: entries.len(),
    })
}
