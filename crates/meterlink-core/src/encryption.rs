//! Per-connection encryption state.
//!
//! A context moves `NoKey -> AwaitingAck -> Ready`. Outbound frames may only
//! be sealed once the host has acknowledged the handshake. Each sealed frame
//! carries a nonce whose tail is the message index; the index starts at zero
//! for every new key and increases by one per frame.
//!
//! Inbound frames must carry a recognised AAD label (`chunk_<n>`,
//! `message_<n>`, or `encrypted_response_final`). Labels are only unique
//! within one response, so the assembler rejects repeats inside a stream; a
//! frame replayed from an earlier response under the same key is not
//! detectable here.

use crate::error::EngineError;
use log::debug;
use meterlink_crypto::{
    CryptoProvider, SealedBox, SessionKey, indexed_nonce, message_aad,
};
use meterlink_protocol::{SealedFrame, SessionId};

const RESPONSE_FINAL_AAD: &str = "encrypted_response_final";

/// Label carried in the AAD of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum InboundLabel {
    Chunk(u64),
    Message(u64),
    ResponseFinal,
}

impl InboundLabel {
    fn parse(aad: &[u8]) -> Option<Self> {
        let aad = std::str::from_utf8(aad).ok()?;
        if aad == RESPONSE_FINAL_AAD {
            return Some(InboundLabel::ResponseFinal);
        }
        let index = |digits: &str| {
            (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                .then(|| digits.parse().ok())
                .flatten()
        };
        if let Some(digits) = aad.strip_prefix("chunk_") {
            return index(digits).map(InboundLabel::Chunk);
        }
        aad.strip_prefix("message_")
            .and_then(index)
            .map(InboundLabel::Message)
    }
}

#[derive(Debug, Default)]
enum KeyState {
    #[default]
    NoKey,
    AwaitingAck(SessionKey),
    Ready(SessionKey),
}

#[derive(Debug, Default)]
pub(crate) struct EncryptionContext {
    state: KeyState,
    message_index: u64,
}

impl EncryptionContext {
    /// Install a fresh key pending acknowledgment; resets the message index.
    pub(crate) fn begin(&mut self, key: SessionKey) {
        self.state = KeyState::AwaitingAck(key);
        self.message_index = 0;
    }

    /// Promote the pending key after the host acknowledged it.
    pub(crate) fn acknowledge(&mut self) -> bool {
        match std::mem::take(&mut self.state) {
            KeyState::AwaitingAck(key) | KeyState::Ready(key) => {
                self.state = KeyState::Ready(key);
                true
            }
            KeyState::NoKey => false,
        }
    }

    /// Discard any key, e.g. after a failed handshake.
    pub(crate) fn abort(&mut self) {
        self.state = KeyState::NoKey;
        self.message_index = 0;
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.state, KeyState::Ready(_))
    }

    /// Next index to be used for an outbound frame.
    #[cfg(test)]
    pub(crate) fn message_index(&self) -> u64 {
        self.message_index
    }

    /// Seal an outbound payload. The index advances only after success.
    pub(crate) fn seal(
        &mut self,
        session_id: SessionId,
        crypto: &dyn CryptoProvider,
        plaintext: &[u8],
    ) -> Result<SealedFrame, EngineError> {
        let KeyState::Ready(key) = &self.state else {
            return Err(EngineError::EncryptionNotReady(session_id));
        };
        let index = self.message_index;
        let nonce = indexed_nonce(index);
        let aad = message_aad(index).into_bytes();
        let ciphertext = crypto.encrypt(key, &nonce, plaintext, &aad)?;
        self.message_index += 1;
        debug!(
            "sealed outbound frame (session_id={}, index={}, len={})",
            session_id,
            index,
            plaintext.len()
        );
        Ok(SealedBox {
            ciphertext,
            nonce: nonce.to_vec(),
            aad,
        }
        .to_frame(Some(index)))
    }

    /// Open an inbound frame with the active key. Frames whose AAD is not a
    /// recognised label are refused before decryption.
    pub(crate) fn open(
        &self,
        session_id: SessionId,
        crypto: &dyn CryptoProvider,
        frame: &SealedFrame,
    ) -> Result<(InboundLabel, Vec<u8>), EngineError> {
        let KeyState::Ready(key) = &self.state else {
            return Err(EngineError::EncryptionNotReady(session_id));
        };
        let sealed = SealedBox::from_frame(frame)?;
        let label = InboundLabel::parse(&sealed.aad).ok_or_else(|| {
            EngineError::UnexpectedResponse(format!(
                "unrecognised frame label ({})",
                String::from_utf8_lossy(&sealed.aad)
            ))
        })?;
        let plaintext = crypto.decrypt(key, &sealed.nonce, &sealed.ciphertext, &sealed.aad)?;
        Ok((label, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterlink_crypto::{Secp256k1Crypto, aead_decrypt, nonce_index};
    use pretty_assertions::assert_eq;

    #[test]
    fn sealing_requires_acknowledged_key() {
        let crypto = Secp256k1Crypto::generate();
        let mut context = EncryptionContext::default();
        assert!(matches!(
            context.seal(SessionId(1), &crypto, b"hi"),
            Err(EngineError::EncryptionNotReady(_))
        ));

        context.begin(SessionKey::random());
        assert!(!context.is_ready());
        assert!(context.seal(SessionId(1), &crypto, b"hi").is_err());
        assert!(context.acknowledge());
        assert!(context.is_ready());
    }

    #[test]
    fn indices_increase_and_reset_on_new_key() {
        let crypto = Secp256k1Crypto::generate();
        let key = SessionKey::random();
        let mut context = EncryptionContext::default();
        context.begin(key.clone());
        context.acknowledge();

        for expected in 0..3u64 {
            let frame = context.seal(SessionId(1), &crypto, b"prompt").expect("seal");
            let sealed = SealedBox::from_frame(&frame).expect("frame");
            assert_eq!(frame.index, Some(expected));
            assert_eq!(nonce_index(&sealed.nonce), Some(expected));
            assert_eq!(sealed.aad, format!("message_{expected}").into_bytes());
            let plaintext =
                aead_decrypt(&key, &sealed.nonce, &sealed.ciphertext, &sealed.aad).expect("open");
            assert_eq!(plaintext, b"prompt".to_vec());
        }
        assert_eq!(context.message_index(), 3);

        context.begin(SessionKey::random());
        context.acknowledge();
        assert_eq!(context.message_index(), 0);
    }

    #[test]
    fn abort_forgets_key() {
        let mut context = EncryptionContext::default();
        context.begin(SessionKey::random());
        context.abort();
        assert!(!context.acknowledge());
        assert!(!context.is_ready());
    }

    fn inbound(key: &SessionKey, aad: &str) -> SealedFrame {
        let nonce = meterlink_crypto::random_nonce();
        let ciphertext =
            meterlink_crypto::aead_encrypt(key, &nonce, b"text", aad.as_bytes()).expect("seal");
        SealedBox {
            ciphertext,
            nonce: nonce.to_vec(),
            aad: aad.as_bytes().to_vec(),
        }
        .to_frame(None)
    }

    #[test]
    fn inbound_frames_need_a_known_label() {
        let crypto = Secp256k1Crypto::generate();
        let key = SessionKey::random();
        let mut context = EncryptionContext::default();
        context.begin(key.clone());
        context.acknowledge();

        let open = |aad: &str| context.open(SessionId(1), &crypto, &inbound(&key, aad));
        assert_eq!(open("chunk_3").expect("chunk").0, InboundLabel::Chunk(3));
        assert_eq!(open("message_0").expect("message").0, InboundLabel::Message(0));
        assert_eq!(
            open("encrypted_response_final").expect("final").0,
            InboundLabel::ResponseFinal
        );
        for aad in ["", "chunk_", "chunk_x", "chunk_+1", "session_init", "other_2"] {
            assert!(
                matches!(open(aad), Err(EngineError::UnexpectedResponse(_))),
                "label {aad:?} accepted"
            );
        }
    }
}
