//! Cryptographic capability interface consumed by the engine.

use crate::envelope::{SealedEnvelope, aead_decrypt, aead_encrypt, open_with, seal_to};
use crate::key::{NONCE_LEN, SessionKey, decode_hex};
use crate::CryptoError;
use chacha20poly1305::aead::OsRng;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::{PublicKey, SecretKey};
use log::debug;
use zeroize::Zeroizing;

/// AAD bound to handshake envelopes.
pub const SESSION_INIT_AAD: &[u8] = b"session_init";

/// Key agreement, AEAD, signing, and recovery-key access.
pub trait CryptoProvider: Send + Sync {
    /// Fresh random symmetric key for a handshake.
    fn generate_session_key(&self) -> SessionKey;

    /// Identity advertised to hosts; hex of the compressed signing public key.
    fn client_address(&self) -> String;

    /// Seal a payload to a host public key, signed by the client identity.
    fn seal_for_host(
        &self,
        host_public_key: &PublicKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedEnvelope, CryptoError>;

    fn encrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Open an envelope sealed to the long-lived recovery key.
    fn open_with_recovery_key(
        &self,
        envelope: &SealedEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;

    /// Check `signature` over `message` against a hex-encoded SEC1 public key.
    fn verify_signature(
        &self,
        message: &[u8],
        signature: &[u8],
        expected_signer: &str,
    ) -> Result<(), CryptoError> {
        verify_signature(message, signature, expected_signer)
    }
}

/// Default provider: secp256k1 identity, XChaCha20-Poly1305 framing.
pub struct Secp256k1Crypto {
    signing_key: SigningKey,
    recovery_key: Option<SecretKey>,
}

impl Secp256k1Crypto {
    /// Provider with a freshly generated identity and no recovery key.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
            recovery_key: None,
        }
    }

    /// Provider from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(raw: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(decode_hex("secret_key", raw)?);
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|err| CryptoError::InvalidKey(format!("signing key: {err}")))?;
        Ok(Self {
            signing_key,
            recovery_key: None,
        })
    }

    /// Attach the long-lived key used to open recovery deltas.
    pub fn with_recovery_key(mut self, recovery_key: SecretKey) -> Self {
        self.recovery_key = Some(recovery_key);
        self
    }

    /// Public half of the recovery key, for hosts that seal deltas.
    pub fn recovery_public_key(&self) -> Option<PublicKey> {
        self.recovery_key.as_ref().map(SecretKey::public_key)
    }

    /// Sign a message with the client identity.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

impl CryptoProvider for Secp256k1Crypto {
    fn generate_session_key(&self) -> SessionKey {
        SessionKey::random()
    }

    fn client_address(&self) -> String {
        encode_public_key(self.signing_key.verifying_key())
    }

    fn seal_for_host(
        &self,
        host_public_key: &PublicKey,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedEnvelope, CryptoError> {
        debug!("sealing payload for host (len={})", plaintext.len());
        seal_to(host_public_key, &self.signing_key, plaintext, aad)
    }

    fn encrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aead_encrypt(key, nonce, plaintext, aad)
    }

    fn decrypt(
        &self,
        key: &SessionKey,
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        aead_decrypt(key, nonce, ciphertext, aad)
    }

    fn open_with_recovery_key(
        &self,
        envelope: &SealedEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let recovery_key = self
            .recovery_key
            .as_ref()
            .ok_or(CryptoError::RecoveryKeyMissing)?;
        open_with(recovery_key, envelope)
    }
}

/// Fresh random secp256k1 secret, e.g. for a recovery key.
pub fn generate_secret_key() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

/// Hex of a compressed SEC1 verifying key, `0x`-prefixed.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    format!("0x{}", hex::encode(key.to_encoded_point(true).as_bytes()))
}

/// Parse a hex SEC1 public key (compressed or uncompressed).
pub fn parse_public_key(raw: &str) -> Result<PublicKey, CryptoError> {
    let bytes = decode_hex("public_key", raw)?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|err| CryptoError::InvalidKey(format!("public key: {err}")))
}

/// Verify a compact ECDSA signature against a hex-encoded signer key.
pub fn verify_signature(
    message: &[u8],
    signature: &[u8],
    expected_signer: &str,
) -> Result<(), CryptoError> {
    let mismatch = || CryptoError::SignatureInvalid {
        signer: expected_signer.to_string(),
    };
    let verifying_key = VerifyingKey::from(parse_public_key(expected_signer)?);
    let signature = Signature::from_slice(signature).map_err(|_| mismatch())?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| mismatch())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn signature_verifies_only_for_signer() {
        let signer = Secp256k1Crypto::generate();
        let other = Secp256k1Crypto::generate();
        let signature = signer.sign(b"index");

        signer
            .verify_signature(b"index", &signature, &signer.client_address())
            .expect("valid");
        assert!(matches!(
            signer.verify_signature(b"index", &signature, &other.client_address()),
            Err(CryptoError::SignatureInvalid { .. })
        ));
        assert!(
            signer
                .verify_signature(b"tampered", &signature, &signer.client_address())
                .is_err()
        );
    }

    #[test]
    fn recovery_key_opens_sealed_delta() {
        let recovery = SecretKey::random(&mut OsRng);
        let host = Secp256k1Crypto::generate();
        let client = Secp256k1Crypto::generate().with_recovery_key(recovery.clone());

        let public = client.recovery_public_key().expect("recovery key");
        let envelope = host
            .seal_for_host(&public, b"{\"messages\":[]}", b"checkpoint_0")
            .expect("seal");
        let opened = client.open_with_recovery_key(&envelope).expect("open");
        assert_eq!(opened.as_slice(), b"{\"messages\":[]}");

        let without_key = Secp256k1Crypto::generate();
        assert!(matches!(
            without_key.open_with_recovery_key(&envelope),
            Err(CryptoError::RecoveryKeyMissing)
        ));
    }

    #[test]
    fn client_address_round_trips_through_parser() {
        let crypto = Secp256k1Crypto::generate();
        let parsed = parse_public_key(&crypto.client_address()).expect("parse");
        assert_eq!(
            VerifyingKey::from(parsed),
            *crypto.signing_key.verifying_key()
        );
    }
}
