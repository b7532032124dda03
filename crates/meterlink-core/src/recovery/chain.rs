use super::{
    ChainRecoveryRequest, RecoveredConversation, RecoveryDeps, ensure_contiguous, load_delta,
    merge_messages, same_hash,
};
use crate::error::{EngineError, RecoveryError};
use log::info;

/// Rebuild a conversation from on-chain proof submission events alone.
pub(crate) async fn recover_from_chain(
    deps: &RecoveryDeps<'_>,
    request: &ChainRecoveryRequest,
) -> Result<RecoveredConversation, EngineError> {
    let mut events = deps
        .payment
        .proof_submission_events(request.chain_id, request.job_id)
        .await
        .map_err(EngineError::collaborator("payment"))?;
    events.sort_by_key(|event| event.index);
    ensure_contiguous(events.iter().map(|event| event.index))?;

    let mut messages = Vec::new();
    let mut token_count: u64 = 0;
    let mut session = None;
    for event in &events {
        let cid = event
            .delta_cid
            .as_deref()
            .ok_or(RecoveryError::MissingDelta {
                index: event.index,
                cid: None,
            })?;
        let delta = load_delta(deps, event.index, cid, session, None).await?;
        session.get_or_insert(delta.session_id);
        if let Some(hash) = delta.proof_hash.as_deref()
            && !same_hash(hash, &event.proof_hash)
        {
            return Err(RecoveryError::ProofHashMismatch {
                index: event.index,
                expected: hash.to_string(),
                actual: Some(event.proof_hash.clone()),
            }
            .into());
        }
        merge_messages(&mut messages, delta.messages);
        token_count = token_count.saturating_add(event.tokens_claimed);
    }

    info!(
        "conversation recovered from chain (chain_id={}, job_id={}, checkpoints={})",
        request.chain_id,
        request.job_id,
        events.len()
    );
    Ok(RecoveredConversation {
        messages,
        token_count,
        checkpoint_count: events.len(),
    })
}
