//! Session protocol engine for pay-per-token streaming inference.
//!
//! This crate owns the session store, the per-endpoint connection pool, the
//! encrypted handshake, the streaming response assembler, correlation of
//! auxiliary requests, and checkpoint-based conversation recovery. Payment,
//! storage, cryptography, and host key lookup are supplied by the caller.

mod assembler;
mod encryption;
mod engine;
pub mod error;
mod host_keys;
mod pending;
mod rag;
pub mod recovery;
pub mod services;
mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use engine::{Collaborators, SessionEngine};
pub use error::{CollaboratorError, EngineError, RecoveryError};
pub use host_keys::CachedHostKeys;
pub use recovery::{
    ChainRecoveryRequest, CheckpointDelta, CheckpointEntry, CheckpointIndex, CheckpointSource,
    HostRecoveryRequest, HttpCheckpointSource, RecoveredConversation, SignedCheckpointIndex,
};
pub use services::{
    CheckpointReceipt, HostKeyDirectory, JobAllocation, JobRequest, PaymentService,
    ProofSubmission, SettlementReceipt, StorageService,
};
pub use transport::{Duplex, TransportConnector, WsConnector};
pub use types::{
    Completion, CompletionOutcome, ConversationMessage, PromptOptions, RagContext, Role,
    SearchResults, SessionRecord, StartSessionRequest, StoredConversation, UploadSummary,
};
/// Cancellation handle returned by [`SessionEngine::cancel_handle`].
pub use tokio_util::sync::CancellationToken;
