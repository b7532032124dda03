//! Symmetric session keys and nonce construction.

use crate::CryptoError;
use chacha20poly1305::aead::OsRng;
use chacha20poly1305::aead::rand_core::RngCore;
use std::fmt;
use zeroize::Zeroizing;

/// Length of a session key in bytes.
pub const KEY_LEN: usize = 32;
/// Length of an XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_LEN: usize = 24;
/// Random prefix length of an indexed nonce; the rest is the message index.
const NONCE_RANDOM_LEN: usize = 16;

/// Per-session symmetric key. Wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; KEY_LEN]>);

impl SessionKey {
    /// Generate a fresh random key.
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Decode a hex key, tolerating a `0x` prefix.
    pub fn from_hex(raw: &str) -> Result<Self, CryptoError> {
        let decoded = Zeroizing::new(decode_hex("session_key", raw)?);
        let bytes: [u8; KEY_LEN] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    field: "session_key",
                    expected: KEY_LEN,
                    actual: decoded.len(),
                })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex form for embedding in a sealed handshake payload.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0.as_ref()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Nonce carrying the message index in its last eight bytes, big-endian.
pub fn indexed_nonce(index: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce[..NONCE_RANDOM_LEN]);
    nonce[NONCE_RANDOM_LEN..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Fully random nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Message index embedded by [`indexed_nonce`].
pub fn nonce_index(nonce: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = nonce.get(NONCE_RANDOM_LEN..NONCE_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

/// Associated data bound to an outbound message.
pub fn message_aad(index: u64) -> String {
    format!("message_{index}")
}

pub(crate) fn decode_hex(field: &'static str, raw: &str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(trimmed).map_err(|source| CryptoError::InvalidHex { field, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn indexed_nonce_embeds_index() {
        let nonce = indexed_nonce(513);
        assert_eq!(nonce_index(&nonce), Some(513));
        assert_ne!(indexed_nonce(513), nonce);
    }

    #[test]
    fn session_key_hex_round_trip_and_redacted_debug() {
        let key = SessionKey::random();
        let restored = SessionKey::from_hex(&format!("0x{}", key.to_hex().as_str()))
            .expect("decode");
        assert_eq!(restored.as_bytes(), key.as_bytes());
        assert_eq!(format!("{key:?}"), "SessionKey(<redacted>)");
    }

    #[test]
    fn session_key_rejects_wrong_length() {
        let err = SessionKey::from_hex("abcd").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidLength {
                expected: KEY_LEN,
                actual: 2,
                ..
            }
        ));
    }
}
