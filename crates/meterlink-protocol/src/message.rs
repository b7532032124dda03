//! Transport message taxonomy exchanged with a compute host.
//!
//! Frames are JSON objects tagged by `type`. Outbound frames are
//! [`ClientMessage`], inbound frames are [`HostMessage`]. Inbound types the
//! engine does not know about decode to [`HostMessage::Unknown`] and are
//! ignored by the dispatcher.

use crate::ids::{ChainId, JobId, RequestId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Hex-encoded AEAD frame used for every encrypted message after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedFrame {
    #[serde(rename = "ciphertextHex")]
    pub ciphertext_hex: String,
    #[serde(rename = "nonceHex")]
    pub nonce_hex: String,
    #[serde(rename = "aadHex")]
    pub aad_hex: String,
    /// Sender-side message or chunk index, when the sender reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

/// Hex-encoded handshake envelope sealed to the host's public key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedInitFrame {
    #[serde(rename = "ephPubHex")]
    pub eph_pub_hex: String,
    #[serde(rename = "ciphertextHex")]
    pub ciphertext_hex: String,
    #[serde(rename = "signatureHex")]
    pub signature_hex: String,
    #[serde(rename = "nonceHex")]
    pub nonce_hex: String,
    #[serde(rename = "aadHex")]
    pub aad_hex: String,
}

/// Plaintext carried inside an `encrypted_session_init` envelope.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInitPayload {
    #[serde(rename = "sessionKey")]
    pub session_key_hex: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(rename = "pricePerToken")]
    pub price_per_token: u64,
    #[serde(rename = "clientAddress")]
    pub client_address: String,
}

impl fmt::Debug for SessionInitPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInitPayload")
            .field("session_key_hex", &"<redacted>")
            .field("job_id", &self.job_id)
            .field("model_name", &self.model_name)
            .field("price_per_token", &self.price_per_token)
            .field("client_address", &self.client_address)
            .finish()
    }
}

/// Image attached to a prompt for vision-capable models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAttachment {
    /// Base64-encoded image bytes.
    pub data: String,
    /// Image format, e.g. `png`.
    pub format: String,
}

/// Reasoning effort requested from models that support it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    Off,
    Low,
    Medium,
    High,
}

/// Structured inference request; the plaintext of `encrypted_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptPayload {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingMode>,
}

/// One vector to ingest into the host-side vector store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Value,
}

/// Single similarity-search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorSearchHit {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// Single web-search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebSearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Token accounting reported by the host on terminal messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub context_window_size: Option<u64>,
    #[serde(default)]
    pub llm_tokens: Option<u64>,
    #[serde(default)]
    pub vlm_tokens: Option<u64>,
}

/// Frames sent from the client to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Plaintext handshake.
    #[serde(rename = "session_init")]
    SessionInit {
        session_id: SessionId,
        job_id: JobId,
        chain_id: ChainId,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        price_per_token: Option<u64>,
    },
    /// Handshake carrying a fresh session key sealed to the host key.
    #[serde(rename = "encrypted_session_init")]
    EncryptedSessionInit {
        session_id: SessionId,
        job_id: JobId,
        chain_id: ChainId,
        payload: SealedInitFrame,
    },
    /// Plaintext inference request.
    #[serde(rename = "prompt")]
    Prompt {
        id: RequestId,
        session_id: SessionId,
        job_id: JobId,
        request: PromptPayload,
    },
    /// Inference request sealed under the session key.
    #[serde(rename = "encrypted_message")]
    EncryptedMessage {
        id: RequestId,
        session_id: SessionId,
        payload: SealedFrame,
    },
    /// Best-effort notice that the client stopped listening.
    #[serde(rename = "stream_cancel")]
    StreamCancel {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        reason: String,
    },
    #[serde(rename = "uploadVectors")]
    UploadVectors {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        session_id: SessionId,
        vectors: Vec<VectorRecord>,
        replace: bool,
    },
    #[serde(rename = "searchVectors")]
    SearchVectors {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        session_id: SessionId,
        #[serde(rename = "queryVector")]
        query_vector: Vec<f32>,
        k: usize,
        threshold: f32,
    },
    #[serde(rename = "searchWeb")]
    SearchWeb {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        session_id: SessionId,
        query: String,
        #[serde(rename = "numResults")]
        num_results: usize,
    },
}

impl ClientMessage {
    /// Wire name of the frame.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::SessionInit { .. } => "session_init",
            ClientMessage::EncryptedSessionInit { .. } => "encrypted_session_init",
            ClientMessage::Prompt { .. } => "prompt",
            ClientMessage::EncryptedMessage { .. } => "encrypted_message",
            ClientMessage::StreamCancel { .. } => "stream_cancel",
            ClientMessage::UploadVectors { .. } => "uploadVectors",
            ClientMessage::SearchVectors { .. } => "searchVectors",
            ClientMessage::SearchWeb { .. } => "searchWeb",
        }
    }

    /// True for frames that carry user prompt content.
    pub fn carries_prompt(&self) -> bool {
        matches!(
            self,
            ClientMessage::Prompt { .. } | ClientMessage::EncryptedMessage { .. }
        )
    }

    /// Encode to a text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frames received from the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// Greeting sent right after the socket opens.
    #[serde(rename = "connected")]
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "session_init_ack")]
    SessionInitAck {
        #[serde(default, deserialize_with = "lenient_session_id")]
        session_id: Option<SessionId>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "stream_chunk")]
    StreamChunk {
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        tokens: Option<u64>,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    #[serde(rename = "encrypted_chunk")]
    EncryptedChunk {
        #[serde(default)]
        id: Option<RequestId>,
        payload: SealedFrame,
        #[serde(default)]
        tokens: Option<u64>,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    /// Full (non-streaming) content or the final content marker.
    #[serde(rename = "response")]
    Response {
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default)]
        content: String,
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    /// Sealed finish reason for an encrypted stream.
    #[serde(rename = "encrypted_response")]
    EncryptedResponse {
        #[serde(default)]
        id: Option<RequestId>,
        payload: SealedFrame,
    },
    /// Authoritative terminal message.
    #[serde(rename = "stream_end")]
    StreamEnd {
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default)]
        usage: Option<TokenUsage>,
        #[serde(default)]
        finish_reason: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        id: Option<RequestId>,
        #[serde(default, alias = "requestId")]
        request_id: Option<RequestId>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default, alias = "error")]
        message: Option<String>,
        #[serde(default)]
        prompt_tokens: Option<u64>,
        #[serde(default)]
        context_window_size: Option<u64>,
    },
    #[serde(rename = "uploadVectorsResponse")]
    UploadVectorsResponse {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        status: String,
        #[serde(default)]
        uploaded: usize,
        #[serde(default)]
        rejected: usize,
        #[serde(default)]
        errors: Vec<String>,
    },
    #[serde(rename = "searchVectorsResponse")]
    SearchVectorsResponse {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        results: Vec<VectorSearchHit>,
        #[serde(default, rename = "totalResults")]
        total_results: usize,
        #[serde(default, rename = "searchTimeMs")]
        search_time_ms: f64,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "searchWebResponse")]
    SearchWebResponse {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        results: Vec<WebSearchHit>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Hosts echo session ids in assorted shapes; anything non-numeric reads as absent.
fn lenient_session_id<'de, D>(deserializer: D) -> Result<Option<SessionId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match value {
        Value::Number(number) => number.as_u64().map(SessionId),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }))
}

/// Routing class of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Connection greeting and unrecognized frames.
    Ignored,
    /// Handshake acknowledgment.
    Handshake,
    /// Part of the primary prompt stream.
    Stream,
    /// Response to a correlated auxiliary request.
    Correlated,
    /// Terminal failure; routed by correlation id.
    Failure,
}

impl HostMessage {
    /// Decode a text frame.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Wire name of the frame.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostMessage::Connected { .. } => "connected",
            HostMessage::SessionInitAck { .. } => "session_init_ack",
            HostMessage::StreamChunk { .. } => "stream_chunk",
            HostMessage::EncryptedChunk { .. } => "encrypted_chunk",
            HostMessage::Response { .. } => "response",
            HostMessage::EncryptedResponse { .. } => "encrypted_response",
            HostMessage::StreamEnd { .. } => "stream_end",
            HostMessage::Error { .. } => "error",
            HostMessage::UploadVectorsResponse { .. } => "uploadVectorsResponse",
            HostMessage::SearchVectorsResponse { .. } => "searchVectorsResponse",
            HostMessage::SearchWebResponse { .. } => "searchWebResponse",
            HostMessage::Unknown => "unknown",
        }
    }

    /// Routing class used by the connection dispatcher.
    pub fn class(&self) -> MessageClass {
        match self {
            HostMessage::Connected { .. } | HostMessage::Unknown => MessageClass::Ignored,
            HostMessage::SessionInitAck { .. } => MessageClass::Handshake,
            HostMessage::StreamChunk { .. }
            | HostMessage::EncryptedChunk { .. }
            | HostMessage::Response { .. }
            | HostMessage::EncryptedResponse { .. }
            | HostMessage::StreamEnd { .. } => MessageClass::Stream,
            HostMessage::UploadVectorsResponse { .. }
            | HostMessage::SearchVectorsResponse { .. }
            | HostMessage::SearchWebResponse { .. } => MessageClass::Correlated,
            HostMessage::Error { .. } => MessageClass::Failure,
        }
    }

    /// Correlation id echoed by the host, if any.
    pub fn correlation_id(&self) -> Option<&RequestId> {
        match self {
            HostMessage::StreamChunk { id, .. }
            | HostMessage::EncryptedChunk { id, .. }
            | HostMessage::Response { id, .. }
            | HostMessage::EncryptedResponse { id, .. }
            | HostMessage::StreamEnd { id, .. } => id.as_ref(),
            HostMessage::Error { id, request_id, .. } => id.as_ref().or(request_id.as_ref()),
            HostMessage::UploadVectorsResponse { request_id, .. }
            | HostMessage::SearchVectorsResponse { request_id, .. }
            | HostMessage::SearchWebResponse { request_id, .. } => Some(request_id),
            HostMessage::Connected { .. }
            | HostMessage::SessionInitAck { .. }
            | HostMessage::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unknown_host_types_decode_to_unknown() {
        let message = HostMessage::parse(r#"{"type":"proof_submitted","tx":"0xabc"}"#)
            .expect("unknown frames still decode");
        assert_eq!(message, HostMessage::Unknown);
        assert_eq!(message.class(), MessageClass::Ignored);
    }

    #[test]
    fn encrypted_chunk_reads_final_flag_and_payload() {
        let frame = json!({
            "type": "encrypted_chunk",
            "id": "req-1",
            "tokens": 3,
            "final": true,
            "payload": {
                "ciphertextHex": "aa",
                "nonceHex": "bb",
                "aadHex": "cc",
                "index": 4
            }
        });
        let message: HostMessage = serde_json::from_value(frame).expect("decode");
        match message {
            HostMessage::EncryptedChunk {
                id,
                payload,
                tokens,
                is_final,
            } => {
                assert_eq!(id, Some(RequestId::from("req-1")));
                assert_eq!(payload.index, Some(4));
                assert_eq!(tokens, Some(3));
                assert!(is_final);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn ack_tolerates_non_numeric_session_ids() {
        let numeric = HostMessage::parse(r#"{"type":"session_init_ack","session_id":"12"}"#)
            .expect("decode");
        let opaque = HostMessage::parse(r#"{"type":"session_init_ack","session_id":"sess-a"}"#)
            .expect("decode");
        assert_eq!(
            numeric,
            HostMessage::SessionInitAck {
                session_id: Some(SessionId(12)),
                status: None,
                message: None,
            }
        );
        assert_eq!(
            opaque,
            HostMessage::SessionInitAck {
                session_id: None,
                status: None,
                message: None,
            }
        );
    }

    #[test]
    fn error_frames_accept_legacy_error_field() {
        let message = HostMessage::parse(r#"{"type":"error","error":"boom"}"#).expect("decode");
        match message {
            HostMessage::Error { message, code, .. } => {
                assert_eq!(message.as_deref(), Some("boom"));
                assert_eq!(code, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn rag_frames_use_camel_case_type_and_fields() {
        let message = ClientMessage::SearchVectors {
            request_id: RequestId::from("r"),
            session_id: SessionId(9),
            query_vector: vec![0.5],
            k: 3,
            threshold: 0.25,
        };
        let value = serde_json::to_value(&message).expect("encode");
        assert_eq!(
            value,
            json!({
                "type": "searchVectors",
                "requestId": "r",
                "session_id": "9",
                "queryVector": [0.5],
                "k": 3,
                "threshold": 0.25
            })
        );
        assert!(!message.carries_prompt());
    }

    #[test]
    fn session_init_payload_debug_redacts_key() {
        let payload = SessionInitPayload {
            session_key_hex: "deadbeef".to_string(),
            job_id: "1".to_string(),
            model_name: "m".to_string(),
            price_per_token: 2,
            client_address: "0x1".to_string(),
        };
        let rendered = format!("{payload:?}");
        assert!(!rendered.contains("deadbeef"));
    }
}
