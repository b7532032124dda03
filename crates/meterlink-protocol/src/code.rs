//! Stable machine-readable error codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of error codes surfaced to engine callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingCollaborator,
    UnsupportedChain,
    InvalidConfig,
    UnknownSession,
    InvalidState,
    TransportError,
    TransportTimeout,
    SessionInitError,
    HostKeyUnavailable,
    EncryptionNotReady,
    CryptoError,
    DecryptionFailed,
    HostError,
    ContextLimitExceeded,
    SessionEnded,
    RequestTimeout,
    RequestCancelled,
    SignatureMismatch,
    ProofHashMismatch,
    MissingDelta,
    CorruptDelta,
    SequenceGap,
    CheckpointIndexUnavailable,
    DimensionMismatch,
    InvalidTopK,
    InvalidThreshold,
    InvalidQuery,
    RagNotConfigured,
    RagAlreadyAttached,
    CollaboratorError,
    SerializationError,
}

/// Host error codes that mean the prompt exceeded the model's context window.
const CONTEXT_LIMIT_HOST_CODES: &[&str] = &[
    "CONTEXT_LIMIT_EXCEEDED",
    "CONTEXT_LENGTH_EXCEEDED",
    "TOKEN_LIMIT_EXCEEDED",
    "PROMPT_TOO_LONG",
];

impl ErrorCode {
    /// Wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingCollaborator => "MISSING_COLLABORATOR",
            ErrorCode::UnsupportedChain => "UNSUPPORTED_CHAIN",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::UnknownSession => "UNKNOWN_SESSION",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::TransportTimeout => "TRANSPORT_TIMEOUT",
            ErrorCode::SessionInitError => "SESSION_INIT_ERROR",
            ErrorCode::HostKeyUnavailable => "HOST_KEY_UNAVAILABLE",
            ErrorCode::EncryptionNotReady => "ENCRYPTION_NOT_READY",
            ErrorCode::CryptoError => "CRYPTO_ERROR",
            ErrorCode::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorCode::HostError => "HOST_ERROR",
            ErrorCode::ContextLimitExceeded => "CONTEXT_LIMIT_EXCEEDED",
            ErrorCode::SessionEnded => "SESSION_ENDED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RequestCancelled => "REQUEST_CANCELLED",
            ErrorCode::SignatureMismatch => "SIGNATURE_MISMATCH",
            ErrorCode::ProofHashMismatch => "PROOF_HASH_MISMATCH",
            ErrorCode::MissingDelta => "MISSING_DELTA",
            ErrorCode::CorruptDelta => "CORRUPT_DELTA",
            ErrorCode::SequenceGap => "SEQUENCE_GAP",
            ErrorCode::CheckpointIndexUnavailable => "CHECKPOINT_INDEX_UNAVAILABLE",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
            ErrorCode::InvalidTopK => "INVALID_TOP_K",
            ErrorCode::InvalidThreshold => "INVALID_THRESHOLD",
            ErrorCode::InvalidQuery => "INVALID_QUERY",
            ErrorCode::RagNotConfigured => "RAG_NOT_CONFIGURED",
            ErrorCode::RagAlreadyAttached => "RAG_ALREADY_ATTACHED",
            ErrorCode::CollaboratorError => "COLLABORATOR_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }

    /// True when a host-reported code denotes a context window overflow.
    pub fn is_context_limit(host_code: &str) -> bool {
        CONTEXT_LIMIT_HOST_CODES
            .iter()
            .any(|code| code.eq_ignore_ascii_case(host_code))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
