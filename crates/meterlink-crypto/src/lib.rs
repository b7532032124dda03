//! Cryptographic capabilities for the session engine.
//!
//! The engine never touches cipher or curve primitives directly; it goes
//! through [`CryptoProvider`]. The default [`Secp256k1Crypto`] pairs a
//! secp256k1 identity (ECDH + ECDSA) with XChaCha20-Poly1305 framing.

mod envelope;
mod error;
mod key;
mod provider;

pub use envelope::{SealedBox, SealedEnvelope, aead_decrypt, aead_encrypt, open_with, seal_to};
pub use error::CryptoError;
pub use key::{
    KEY_LEN, NONCE_LEN, SessionKey, indexed_nonce, message_aad, nonce_index, random_nonce,
};
pub use provider::{
    CryptoProvider, SESSION_INIT_AAD, Secp256k1Crypto, encode_public_key, generate_secret_key,
    parse_public_key, verify_signature,
};

/// Curve types needed by callers that hold host or recovery keys.
pub use k256::{PublicKey, SecretKey};
