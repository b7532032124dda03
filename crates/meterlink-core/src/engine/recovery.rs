use super::SessionEngine;
use crate::error::EngineError;
use crate::recovery::{
    self, ChainRecoveryRequest, HostRecoveryRequest, RecoveredConversation, RecoveryDeps,
};

impl SessionEngine {
    /// Rebuild a conversation from the host's signed checkpoint index,
    /// cross-checked against on-chain proofs.
    pub async fn recover_from_host(
        &self,
        request: &HostRecoveryRequest,
    ) -> Result<RecoveredConversation, EngineError> {
        recovery::recover_from_host(
            &self.recovery_deps(),
            self.checkpoint_source.as_ref(),
            request,
        )
        .await
    }

    /// Rebuild a conversation from on-chain proof events; works with the
    /// host offline.
    pub async fn recover_from_chain(
        &self,
        request: &ChainRecoveryRequest,
    ) -> Result<RecoveredConversation, EngineError> {
        if !self.config.supports_chain(request.chain_id) {
            return Err(EngineError::UnsupportedChain(request.chain_id));
        }
        recovery::recover_from_chain(&self.recovery_deps(), request).await
    }

    fn recovery_deps(&self) -> RecoveryDeps<'_> {
        RecoveryDeps {
            crypto: self.crypto.as_ref(),
            payment: self.payment.as_ref(),
            storage: self.storage.as_ref(),
        }
    }
}
