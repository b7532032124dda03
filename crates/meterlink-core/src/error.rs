//! Error types for the session engine.

use meterlink_config::ConfigError;
use meterlink_crypto::CryptoError;
use meterlink_protocol::{ChainId, ErrorCode, HostMessage, RequestId, SessionId, SessionStatus};
use thiserror::Error;

/// Failure reported by an external collaborator (payment, storage, key
/// directory, checkpoint source).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that abort a recovery call. Recovery never returns a partial
/// transcript alongside one of these.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Checkpoint index signature did not verify against the expected signer.
    #[error("checkpoint index signature does not verify for signer {signer}")]
    SignatureMismatch { signer: String },
    /// Indexed proof hash differs from the on-chain submission.
    #[error("proof hash mismatch at checkpoint {index}: indexed {expected}, on-chain {actual:?}")]
    ProofHashMismatch {
        index: u64,
        expected: String,
        actual: Option<String>,
    },
    /// Referenced delta is absent from storage or the reference is missing.
    #[error("delta for checkpoint {index} is missing (cid={cid:?})")]
    MissingDelta { index: u64, cid: Option<String> },
    /// Delta content could not be parsed or does not match its checkpoint.
    #[error("delta for checkpoint {index} is corrupt: {reason}")]
    CorruptDelta { index: u64, reason: String },
    /// Encrypted delta failed to open with the recovery key.
    #[error("delta for checkpoint {index} failed to decrypt")]
    DecryptionFailed { index: u64 },
    /// Checkpoints are not contiguous.
    #[error("checkpoint sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    /// The host published no checkpoint index for the session.
    #[error("no checkpoint index available for session {session_id}")]
    IndexUnavailable { session_id: SessionId },
}

impl RecoveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RecoveryError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
            RecoveryError::ProofHashMismatch { .. } => ErrorCode::ProofHashMismatch,
            RecoveryError::MissingDelta { .. } => ErrorCode::MissingDelta,
            RecoveryError::CorruptDelta { .. } => ErrorCode::CorruptDelta,
            RecoveryError::DecryptionFailed { .. } => ErrorCode::DecryptionFailed,
            RecoveryError::SequenceGap { .. } => ErrorCode::SequenceGap,
            RecoveryError::IndexUnavailable { .. } => ErrorCode::CheckpointIndexUnavailable,
        }
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required collaborator was not supplied at construction.
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("unsupported chain: {0}")]
    UnsupportedChain(ChainId),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    /// Lifecycle transition not permitted from the current state.
    #[error("invalid state: session is {current}, cannot move to {requested}")]
    InvalidState {
        current: SessionStatus,
        requested: SessionStatus,
    },
    /// Connect or send failure; the session keeps its prior state.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{operation} timed out after {after_ms}ms")]
    TransportTimeout {
        operation: &'static str,
        after_ms: u64,
    },
    /// Host rejected the handshake.
    #[error("session init failed: {0}")]
    SessionInit(String),
    #[error("no public key available for host {0}")]
    HostKeyUnavailable(String),
    #[error("encryption context not ready for session {0}")]
    EncryptionNotReady(SessionId),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    /// Chunks failed to decrypt and no terminal message arrived.
    #[error("stream could not be decrypted ({dropped} chunk(s) dropped)")]
    Decryption { dropped: usize },
    #[error("host error {code}: {message}")]
    Host { code: String, message: String },
    /// Prompt exceeded the model's context window.
    #[error("context limit exceeded (prompt_tokens={prompt_tokens:?}, context_window_size={context_window_size:?}): {message}")]
    ContextLimit {
        prompt_tokens: Option<u64>,
        context_window_size: Option<u64>,
        message: String,
    },
    #[error("session {0} ended")]
    SessionEnded(SessionId),
    #[error("request {request_id} timed out after {after_ms}ms")]
    RequestTimeout { request_id: RequestId, after_ms: u64 },
    #[error("request {0} cancelled")]
    RequestCancelled(RequestId),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("vector {vector_id} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        vector_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("top-k must be within 1..={max}, got {k}")]
    InvalidTopK { k: usize, max: usize },
    #[error("similarity threshold must be within 0.0..=1.0, got {0}")]
    InvalidThreshold(f32),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("no vector database attached to session {0}")]
    RagNotConfigured(SessionId),
    #[error("session {session_id} already uses vector database {existing}")]
    RagAlreadyAttached {
        session_id: SessionId,
        existing: String,
    },
    #[error("{service} failed: {source}")]
    Collaborator {
        service: &'static str,
        #[source]
        source: CollaboratorError,
    },
    #[error("unexpected host response: {0}")]
    UnexpectedResponse(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable code for branching without string matching.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::MissingCollaborator(_) => ErrorCode::MissingCollaborator,
            EngineError::Config(_) => ErrorCode::InvalidConfig,
            EngineError::UnsupportedChain(_) => ErrorCode::UnsupportedChain,
            EngineError::UnknownSession(_) => ErrorCode::UnknownSession,
            EngineError::InvalidState { .. } => ErrorCode::InvalidState,
            EngineError::Transport(_) => ErrorCode::TransportError,
            EngineError::TransportTimeout { .. } => ErrorCode::TransportTimeout,
            EngineError::SessionInit(_) => ErrorCode::SessionInitError,
            EngineError::HostKeyUnavailable(_) => ErrorCode::HostKeyUnavailable,
            EngineError::EncryptionNotReady(_) => ErrorCode::EncryptionNotReady,
            EngineError::Crypto(_) => ErrorCode::CryptoError,
            EngineError::Decryption { .. } => ErrorCode::DecryptionFailed,
            EngineError::Host { .. } | EngineError::UnexpectedResponse(_) => ErrorCode::HostError,
            EngineError::ContextLimit { .. } => ErrorCode::ContextLimitExceeded,
            EngineError::SessionEnded(_) => ErrorCode::SessionEnded,
            EngineError::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            EngineError::RequestCancelled(_) => ErrorCode::RequestCancelled,
            EngineError::Recovery(err) => err.code(),
            EngineError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            EngineError::InvalidTopK { .. } => ErrorCode::InvalidTopK,
            EngineError::InvalidThreshold(_) => ErrorCode::InvalidThreshold,
            EngineError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            EngineError::RagNotConfigured(_) => ErrorCode::RagNotConfigured,
            EngineError::RagAlreadyAttached { .. } => ErrorCode::RagAlreadyAttached,
            EngineError::Collaborator { .. } => ErrorCode::CollaboratorError,
            EngineError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Map a host `error` frame, distinguishing context window overflows.
    pub fn from_host_error(
        code: Option<&str>,
        message: Option<&str>,
        prompt_tokens: Option<u64>,
        context_window_size: Option<u64>,
    ) -> Self {
        let message = message.unwrap_or("host reported an error").to_string();
        let context_limit = code.is_some_and(ErrorCode::is_context_limit)
            || (prompt_tokens.is_some() && context_window_size.is_some());
        if context_limit {
            return EngineError::ContextLimit {
                prompt_tokens,
                context_window_size,
                message,
            };
        }
        EngineError::Host {
            code: code.unwrap_or("UNKNOWN").to_string(),
            message,
        }
    }

    /// Error carried by a host frame; non-error frames are unexpected here.
    pub(crate) fn from_host_message(message: &HostMessage) -> Self {
        match message {
            HostMessage::Error {
                code,
                message,
                prompt_tokens,
                context_window_size,
                ..
            } => Self::from_host_error(
                code.as_deref(),
                message.as_deref(),
                *prompt_tokens,
                *context_window_size,
            ),
            other => EngineError::UnexpectedResponse(other.type_name().to_string()),
        }
    }

    pub(crate) fn collaborator(service: &'static str) -> impl FnOnce(CollaboratorError) -> Self {
        move |source| EngineError::Collaborator { service, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn host_errors_with_window_figures_become_context_limit() {
        let err = EngineError::from_host_error(
            Some("TOKEN_LIMIT_EXCEEDED"),
            Some("prompt too long"),
            Some(40_000),
            Some(32_768),
        );
        assert_eq!(err.code(), ErrorCode::ContextLimitExceeded);
        match err {
            EngineError::ContextLimit {
                prompt_tokens,
                context_window_size,
                ..
            } => {
                assert_eq!(prompt_tokens, Some(40_000));
                assert_eq!(context_window_size, Some(32_768));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_host_errors_keep_their_code() {
        let err = EngineError::from_host_error(Some("MODEL_UNAVAILABLE"), None, None, None);
        assert_eq!(err.code(), ErrorCode::HostError);
        assert!(err.to_string().contains("MODEL_UNAVAILABLE"));
    }

    #[test]
    fn recovery_errors_expose_their_own_codes() {
        let err = EngineError::from(RecoveryError::SignatureMismatch {
            signer: "0xabc".to_string(),
        });
        assert_eq!(err.code(), ErrorCode::SignatureMismatch);
        let err = EngineError::from(RecoveryError::IndexUnavailable {
            session_id: SessionId(1),
        });
        assert_eq!(err.code(), ErrorCode::CheckpointIndexUnavailable);
    }
}
