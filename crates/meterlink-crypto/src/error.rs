//! Error types for cryptographic capabilities.

use thiserror::Error;

/// Errors returned by key agreement, AEAD framing, and signature checks.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A hex field could not be decoded.
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    /// A fixed-size field had the wrong length.
    #[error("invalid length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A public or secret key could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivation,
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptFailed,
    /// AEAD authentication or decryption failed.
    #[error("decryption failed")]
    DecryptFailed,
    /// A signature did not verify against the expected signer.
    #[error("signature does not verify for signer {signer}")]
    SignatureInvalid { signer: String },
    /// No long-lived recovery key is configured.
    #[error("recovery key not configured")]
    RecoveryKeyMissing,
}
