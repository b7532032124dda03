//! AEAD framing and public-key envelopes.
//!
//! A [`SealedBox`] is symmetric ciphertext under a session key. A
//! [`SealedEnvelope`] is ciphertext sealed to a recipient's secp256k1 public
//! key: an ephemeral key pair is generated, ECDH yields a shared secret,
//! HKDF-SHA256 stretches it into an XChaCha20-Poly1305 key, and the sender
//! signs the ciphertext so the recipient can authenticate it.

use crate::key::{KEY_LEN, NONCE_LEN, SessionKey, decode_hex, random_nonce};
use crate::CryptoError;
use chacha20poly1305::aead::{Aead, OsRng, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use k256::ecdh::diffie_hellman;
use k256::ecdsa::SigningKey;
use k256::ecdsa::signature::Signer;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use meterlink_protocol::{SealedFrame, SealedInitFrame};
use sha2::Sha256;
use zeroize::Zeroizing;

/// HKDF info string binding derived keys to this envelope format.
const ENVELOPE_KDF_INFO: &[u8] = b"meterlink-envelope-v1";

/// Symmetric AEAD output with its framing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
}

impl SealedBox {
    /// Hex wire form; `index` is reported alongside when known.
    pub fn to_frame(&self, index: Option<u64>) -> SealedFrame {
        SealedFrame {
            ciphertext_hex: hex::encode(&self.ciphertext),
            nonce_hex: hex::encode(&self.nonce),
            aad_hex: hex::encode(&self.aad),
            index,
        }
    }

    pub fn from_frame(frame: &SealedFrame) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext: decode_hex("ciphertextHex", &frame.ciphertext_hex)?,
            nonce: decode_hex("nonceHex", &frame.nonce_hex)?,
            aad: decode_hex("aadHex", &frame.aad_hex)?,
        })
    }
}

/// Ciphertext sealed to a public key, plus the sender's signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    /// Compressed SEC1 ephemeral public key.
    pub eph_pub: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// Compact ECDSA signature over the ciphertext.
    pub signature: Vec<u8>,
    pub nonce: Vec<u8>,
    pub aad: Vec<u8>,
}

impl SealedEnvelope {
    pub fn to_frame(&self) -> SealedInitFrame {
        SealedInitFrame {
            eph_pub_hex: hex::encode(&self.eph_pub),
            ciphertext_hex: hex::encode(&self.ciphertext),
            signature_hex: hex::encode(&self.signature),
            nonce_hex: hex::encode(&self.nonce),
            aad_hex: hex::encode(&self.aad),
        }
    }

    pub fn from_frame(frame: &SealedInitFrame) -> Result<Self, CryptoError> {
        Ok(Self {
            eph_pub: decode_hex("ephPubHex", &frame.eph_pub_hex)?,
            ciphertext: decode_hex("ciphertextHex", &frame.ciphertext_hex)?,
            signature: decode_hex("signatureHex", &frame.signature_hex)?,
            nonce: decode_hex("nonceHex", &frame.nonce_hex)?,
            aad: decode_hex("aadHex", &frame.aad_hex)?,
        })
    }
}

/// Encrypt under a session key with explicit nonce and associated data.
pub fn aead_encrypt(
    key: &SessionKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    cipher(key.as_bytes())
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypt and authenticate under a session key.
pub fn aead_decrypt(
    key: &SessionKey,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidLength {
            field: "nonce",
            expected: NONCE_LEN,
            actual: nonce.len(),
        });
    }
    cipher(key.as_bytes())
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Seal a payload to `recipient`, signed by `sender`.
pub fn seal_to(
    recipient: &PublicKey,
    sender: &SigningKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<SealedEnvelope, CryptoError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let key = derive_envelope_key(shared.raw_secret_bytes().as_slice())?;
    let nonce = random_nonce();
    let ciphertext = aead_encrypt(&key, &nonce, plaintext, aad)?;
    let signature: k256::ecdsa::Signature = sender.sign(&ciphertext);
    let eph_pub = ephemeral
        .public_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec();
    Ok(SealedEnvelope {
        eph_pub,
        ciphertext,
        signature: signature.to_bytes().to_vec(),
        nonce: nonce.to_vec(),
        aad: aad.to_vec(),
    })
}

/// Open an envelope sealed to the public half of `recipient`.
///
/// Only AEAD integrity is checked here; sender authentication is a separate
/// [`crate::verify_signature`] call against the ciphertext.
pub fn open_with(
    recipient: &SecretKey,
    envelope: &SealedEnvelope,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let eph_pub = PublicKey::from_sec1_bytes(&envelope.eph_pub)
        .map_err(|err| CryptoError::InvalidKey(format!("ephemeral public key: {err}")))?;
    let shared = diffie_hellman(recipient.to_nonzero_scalar(), eph_pub.as_affine());
    let key = derive_envelope_key(shared.raw_secret_bytes().as_slice())?;
    aead_decrypt(&key, &envelope.nonce, &envelope.ciphertext, &envelope.aad).map(Zeroizing::new)
}

fn derive_envelope_key(shared_secret: &[u8]) -> Result<SessionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(ENVELOPE_KDF_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    let key = SessionKey::from_bytes(okm);
    zeroize::Zeroize::zeroize(&mut okm);
    Ok(key)
}

fn cipher(key: &[u8; KEY_LEN]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(key))
}
