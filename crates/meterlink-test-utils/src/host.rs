//! Scripted in-memory compute host.
//!
//! [`MockHost`] is a [`TransportConnector`]: every `connect` spawns a host
//! task on the far end of a pair of channels. The task performs the real
//! host side of the handshake (opens the sealed init with the host secret,
//! checks the client's signature, adopts the session key), decrypts
//! encrypted prompts, and answers them from a queue of [`PromptReply`]
//! scripts. RAG frames are answered from an in-memory vector store.

use async_trait::async_trait;
use log::debug;
use meterlink_core::{Duplex, EngineError, TransportConnector};
use meterlink_crypto::{
    PublicKey, SealedBox, SealedEnvelope, SecretKey, SessionKey, aead_decrypt, aead_encrypt,
    generate_secret_key, message_aad, nonce_index, open_with, random_nonce, verify_signature,
};
use meterlink_protocol::{
    ClientMessage, PromptPayload, RequestId, SealedFrame, SealedInitFrame, SessionId,
    SessionInitPayload, TokenUsage, VectorRecord, VectorSearchHit, WebSearchHit,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One step of a scripted prompt reply.
#[derive(Debug, Clone)]
pub enum HostFrame {
    Chunk(String),
    /// Chunk carrying the `final` flag.
    FinalChunk(String),
    /// Encrypted chunk sealed under a key the client does not hold.
    CorruptChunk,
    /// `response` (or `encrypted_response`) marker carrying a finish reason.
    Response(String),
    /// Plaintext `response` with the full answer.
    Content(String),
    /// Authoritative `stream_end`.
    End(Option<TokenUsage>),
    Error {
        code: String,
        message: String,
        prompt_tokens: Option<u64>,
        context_window_size: Option<u64>,
    },
    /// Frame of a type the client does not know.
    Noise,
    Pause(Duration),
    /// Close the connection.
    Hangup,
}

/// Frames played back in answer to one prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptReply {
    frames: Vec<HostFrame>,
}

impl PromptReply {
    pub fn new(frames: Vec<HostFrame>) -> Self {
        Self { frames }
    }

    /// Chunks followed by `stream_end` with the given usage.
    pub fn stream(chunks: &[&str], usage: Option<TokenUsage>) -> Self {
        let mut frames: Vec<HostFrame> = chunks
            .iter()
            .map(|chunk| HostFrame::Chunk(chunk.to_string()))
            .collect();
        frames.push(HostFrame::End(usage));
        Self { frames }
    }

    /// Never answers.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(vec![HostFrame::Error {
            code: code.to_string(),
            message: message.to_string(),
            prompt_tokens: None,
            context_window_size: None,
        }])
    }

    pub fn context_limit(prompt_tokens: u64, context_window_size: u64) -> Self {
        Self::new(vec![HostFrame::Error {
            code: "TOKEN_LIMIT_EXCEEDED".to_string(),
            message: "prompt exceeds the context window".to_string(),
            prompt_tokens: Some(prompt_tokens),
            context_window_size: Some(context_window_size),
        }])
    }
}

/// How the host answers handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    Accept,
    /// Answer with an `error` frame carrying this message.
    Reject(String),
    Silent,
}

/// Handshake observed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedHandshake {
    pub session_id: SessionId,
    pub job_id: String,
    pub model: String,
    pub encrypted: bool,
    pub client_address: Option<String>,
    pub price_per_token: Option<u64>,
}

/// Prompt observed by the host, decrypted when it arrived sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPrompt {
    pub session_id: SessionId,
    pub request_id: RequestId,
    /// Message index carried by the nonce of an encrypted prompt.
    pub index: Option<u64>,
    pub payload: PromptPayload,
}

#[derive(Default)]
struct Recorded {
    frames: Vec<ClientMessage>,
    handshakes: Vec<ReceivedHandshake>,
    prompts: Vec<ReceivedPrompt>,
}

struct HostState {
    secret: SecretKey,
    replies: Mutex<VecDeque<PromptReply>>,
    ack: Mutex<AckMode>,
    recorded: Mutex<Recorded>,
    vectors: Mutex<Vec<VectorRecord>>,
    search_error: Mutex<Option<String>>,
    rag_silent: AtomicBool,
    refuse: AtomicBool,
    connections: AtomicUsize,
    links: Mutex<Vec<CancellationToken>>,
}

/// In-memory host reachable through [`TransportConnector`].
#[derive(Clone)]
pub struct MockHost {
    state: Arc<HostState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HostState {
                secret: generate_secret_key(),
                replies: Mutex::new(VecDeque::new()),
                ack: Mutex::new(AckMode::Accept),
                recorded: Mutex::new(Recorded::default()),
                vectors: Mutex::new(Vec::new()),
                search_error: Mutex::new(None),
                rag_silent: AtomicBool::new(false),
                refuse: AtomicBool::new(false),
                connections: AtomicUsize::new(0),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Key clients seal handshakes to.
    pub fn public_key(&self) -> PublicKey {
        self.state.secret.public_key()
    }

    /// Queue the reply for the next prompt. Without one, the host streams
    /// `"ok"` and ends.
    pub fn push_reply(&self, reply: PromptReply) {
        self.state.replies.lock().push_back(reply);
    }

    pub fn set_ack(&self, mode: AckMode) {
        *self.state.ack.lock() = mode;
    }

    /// Leave RAG requests unanswered.
    pub fn set_rag_silent(&self, silent: bool) {
        self.state.rag_silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_search_error(&self, error: Option<&str>) {
        *self.state.search_error.lock() = error.map(str::to_string);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Hang up every open connection.
    pub fn drop_connections(&self) {
        for link in self.state.links.lock().drain(..) {
            link.cancel();
        }
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<ClientMessage> {
        self.state.recorded.lock().frames.clone()
    }

    pub fn frame_types(&self) -> Vec<&'static str> {
        self.state
            .recorded
            .lock()
            .frames
            .iter()
            .map(ClientMessage::type_name)
            .collect()
    }

    pub fn handshakes(&self) -> Vec<ReceivedHandshake> {
        self.state.recorded.lock().handshakes.clone()
    }

    pub fn prompts(&self) -> Vec<ReceivedPrompt> {
        self.state.recorded.lock().prompts.clone()
    }

    pub fn stored_vectors(&self) -> usize {
        self.state.vectors.lock().len()
    }
}

#[async_trait]
impl TransportConnector for MockHost {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, EngineError> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(EngineError::Transport(format!(
                "connection refused: {endpoint}"
            )));
        }
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        let (client_tx, host_rx) = mpsc::unbounded_channel();
        let (host_tx, client_rx) = mpsc::unbounded_channel();
        let _ = host_tx.send(json!({"type": "connected", "message": "welcome"}).to_string());

        let hangup = CancellationToken::new();
        self.state.links.lock().push(hangup.clone());
        let link = Link {
            state: self.state.clone(),
            to_client: host_tx,
            key: None,
            hangup,
        };
        tokio::spawn(serve(link, host_rx));
        Ok(Duplex {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

/// Host end of one connection.
struct Link {
    state: Arc<HostState>,
    to_client: mpsc::UnboundedSender<String>,
    key: Option<SessionKey>,
    hangup: CancellationToken,
}

async fn serve(mut link: Link, mut from_client: mpsc::UnboundedReceiver<String>) {
    loop {
        let frame = tokio::select! {
            _ = link.hangup.cancelled() => break,
            frame = from_client.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match serde_json::from_str::<ClientMessage>(&frame) {
            Ok(message) => {
                link.state.recorded.lock().frames.push(message.clone());
                link.handle(message);
            }
            Err(err) => debug!("mock host ignoring frame (err={})", err),
        }
    }
}

impl Link {
    fn send(&self, value: Value) {
        let _ = self.to_client.send(value.to_string());
    }

    fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::SessionInit {
                session_id,
                job_id,
                model,
                price_per_token,
                ..
            } => {
                self.key = None;
                self.record_handshake(ReceivedHandshake {
                    session_id,
                    job_id: job_id.to_string(),
                    model,
                    encrypted: false,
                    client_address: None,
                    price_per_token,
                });
                self.acknowledge(session_id);
            }
            ClientMessage::EncryptedSessionInit {
                session_id,
                job_id,
                payload,
                ..
            } => match self.open_init(&payload) {
                Ok((init, key)) => {
                    if init.job_id != job_id.to_string() {
                        self.send(json!({
                            "type": "error",
                            "code": "SESSION_INIT_FAILED",
                            "message": "job id mismatch",
                        }));
                        return;
                    }
                    self.key = Some(key);
                    self.record_handshake(ReceivedHandshake {
                        session_id,
                        job_id: init.job_id,
                        model: init.model_name,
                        encrypted: true,
                        client_address: Some(init.client_address),
                        price_per_token: Some(init.price_per_token),
                    });
                    self.acknowledge(session_id);
                }
                Err(reason) => self.send(json!({
                    "type": "error",
                    "code": "SESSION_INIT_FAILED",
                    "message": reason,
                })),
            },
            ClientMessage::EncryptedMessage {
                id,
                session_id,
                payload,
            } => {
                let Some(key) = self.key.clone() else {
                    self.send(json!({
                        "type": "error",
                        "id": id,
                        "code": "NO_SESSION_KEY",
                        "message": "encrypted message before handshake",
                    }));
                    return;
                };
                match open_prompt(&key, &payload) {
                    Ok((payload, index)) => {
                        self.state.recorded.lock().prompts.push(ReceivedPrompt {
                            session_id,
                            request_id: id.clone(),
                            index,
                            payload,
                        });
                        self.play(id, Some(key));
                    }
                    Err(reason) => self.send(json!({
                        "type": "error",
                        "id": id,
                        "code": "DECRYPTION_FAILED",
                        "message": reason,
                    })),
                }
            }
            ClientMessage::Prompt {
                id,
                session_id,
                request,
                ..
            } => {
                self.state.recorded.lock().prompts.push(ReceivedPrompt {
                    session_id,
                    request_id: id.clone(),
                    index: None,
                    payload: request,
                });
                self.play(id, None);
            }
            ClientMessage::StreamCancel { .. } => {}
            ClientMessage::UploadVectors {
                request_id,
                vectors,
                replace,
                ..
            } => {
                if self.state.rag_silent.load(Ordering::SeqCst) {
                    return;
                }
                let uploaded = vectors.len();
                {
                    let mut store = self.state.vectors.lock();
                    if replace {
                        store.clear();
                    }
                    store.extend(vectors);
                }
                self.send(json!({
                    "type": "uploadVectorsResponse",
                    "requestId": request_id,
                    "status": "success",
                    "uploaded": uploaded,
                    "rejected": 0,
                    "errors": [],
                }));
            }
            ClientMessage::SearchVectors {
                request_id,
                query_vector,
                threshold,
                ..
            } => {
                if self.state.rag_silent.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(error) = self.state.search_error.lock().clone() {
                    self.send(json!({
                        "type": "searchVectorsResponse",
                        "requestId": request_id,
                        "results": [],
                        "error": error,
                    }));
                    return;
                }
                let hits: Vec<VectorSearchHit> = self
                    .state
                    .vectors
                    .lock()
                    .iter()
                    .map(|record| VectorSearchHit {
                        id: record.id.clone(),
                        score: cosine(&query_vector, &record.vector),
                        metadata: record.metadata.clone(),
                    })
                    .filter(|hit| hit.score >= threshold)
                    .collect();
                self.send(json!({
                    "type": "searchVectorsResponse",
                    "requestId": request_id,
                    "totalResults": hits.len(),
                    "searchTimeMs": 1.5,
                    "results": hits,
                }));
            }
            ClientMessage::SearchWeb {
                request_id,
                query,
                num_results,
                ..
            } => {
                if self.state.rag_silent.load(Ordering::SeqCst) {
                    return;
                }
                let hits: Vec<WebSearchHit> = (0..num_results)
                    .map(|rank| WebSearchHit {
                        title: format!("{query} #{rank}"),
                        url: format!("https://search.test/{rank}"),
                        snippet: String::new(),
                    })
                    .collect();
                self.send(json!({
                    "type": "searchWebResponse",
                    "requestId": request_id,
                    "results": hits,
                }));
            }
        }
    }

    fn record_handshake(&self, handshake: ReceivedHandshake) {
        self.state.recorded.lock().handshakes.push(handshake);
    }

    fn acknowledge(&self, session_id: SessionId) {
        let mode = self.state.ack.lock().clone();
        match mode {
            AckMode::Accept => self.send(json!({
                "type": "session_init_ack",
                "session_id": session_id.get(),
                "status": "success",
            })),
            AckMode::Reject(message) => self.send(json!({
                "type": "error",
                "code": "SESSION_INIT_FAILED",
                "message": message,
            })),
            AckMode::Silent => {}
        }
    }

    fn open_init(&self, frame: &SealedInitFrame) -> Result<(SessionInitPayload, SessionKey), String> {
        let envelope = SealedEnvelope::from_frame(frame).map_err(|err| err.to_string())?;
        let plaintext = open_with(&self.state.secret, &envelope).map_err(|err| err.to_string())?;
        let init: SessionInitPayload =
            serde_json::from_slice(&plaintext).map_err(|err| err.to_string())?;
        verify_signature(&envelope.ciphertext, &envelope.signature, &init.client_address)
            .map_err(|err| err.to_string())?;
        let key = SessionKey::from_hex(&init.session_key_hex).map_err(|err| err.to_string())?;
        Ok((init, key))
    }

    fn play(&self, request_id: RequestId, key: Option<SessionKey>) {
        let reply = self
            .state
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| PromptReply::stream(&["ok"], None));
        tokio::spawn(play(
            reply,
            request_id,
            key,
            self.to_client.clone(),
            self.hangup.clone(),
        ));
    }
}

fn open_prompt(key: &SessionKey, frame: &SealedFrame) -> Result<(PromptPayload, Option<u64>), String> {
    let sealed = SealedBox::from_frame(frame).map_err(|err| err.to_string())?;
    let index = nonce_index(&sealed.nonce);
    if let Some(index) = index
        && sealed.aad != message_aad(index).into_bytes()
    {
        return Err(format!("aad does not match message index {index}"));
    }
    let plaintext = aead_decrypt(key, &sealed.nonce, &sealed.ciphertext, &sealed.aad)
        .map_err(|err| err.to_string())?;
    let payload = serde_json::from_slice(&plaintext).map_err(|err| err.to_string())?;
    Ok((payload, index))
}

async fn play(
    reply: PromptReply,
    id: RequestId,
    key: Option<SessionKey>,
    to_client: mpsc::UnboundedSender<String>,
    hangup: CancellationToken,
) {
    let mut chunk_index = 0u64;
    for frame in reply.frames {
        let value = match frame {
            HostFrame::Chunk(text) => chunk(&id, key.as_ref(), &text, false, &mut chunk_index),
            HostFrame::FinalChunk(text) => chunk(&id, key.as_ref(), &text, true, &mut chunk_index),
            HostFrame::CorruptChunk => {
                let foreign = SessionKey::random();
                chunk(&id, Some(&foreign), "lost", false, &mut chunk_index)
            }
            HostFrame::Response(reason) => match key.as_ref() {
                Some(key) => json!({
                    "type": "encrypted_response",
                    "id": id,
                    "payload": seal(key, reason.as_bytes(), b"encrypted_response_final", None),
                }),
                None => json!({
                    "type": "response",
                    "id": id,
                    "content": "",
                    "finish_reason": reason,
                }),
            },
            HostFrame::Content(text) => json!({
                "type": "response",
                "id": id,
                "content": text,
                "finish_reason": "stop",
            }),
            HostFrame::End(usage) => json!({
                "type": "stream_end",
                "id": id,
                "usage": usage,
                "finish_reason": "stop",
            }),
            HostFrame::Error {
                code,
                message,
                prompt_tokens,
                context_window_size,
            } => json!({
                "type": "error",
                "id": id,
                "code": code,
                "message": message,
                "prompt_tokens": prompt_tokens,
                "context_window_size": context_window_size,
            }),
            HostFrame::Noise => json!({"type": "proof_submitted", "id": id}),
            HostFrame::Pause(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            HostFrame::Hangup => {
                hangup.cancel();
                return;
            }
        };
        if to_client.send(value.to_string()).is_err() {
            return;
        }
    }
}

fn chunk(
    id: &RequestId,
    key: Option<&SessionKey>,
    text: &str,
    is_final: bool,
    index: &mut u64,
) -> Value {
    let current = *index;
    *index += 1;
    match key {
        Some(key) => json!({
            "type": "encrypted_chunk",
            "id": id,
            "tokens": 1,
            "final": is_final,
            "payload": seal(key, text.as_bytes(), format!("chunk_{current}").as_bytes(), Some(current)),
        }),
        None => json!({
            "type": "stream_chunk",
            "id": id,
            "content": text,
            "tokens": 1,
            "final": is_final,
        }),
    }
}

fn seal(key: &SessionKey, plaintext: &[u8], aad: &[u8], index: Option<u64>) -> Value {
    let nonce = random_nonce();
    let ciphertext = aead_encrypt(key, &nonce, plaintext, aad).expect("mock host seal");
    let frame = SealedBox {
        ciphertext,
        nonce: nonce.to_vec(),
        aad: aad.to_vec(),
    }
    .to_frame(index);
    serde_json::to_value(frame).expect("sealed frame encodes")
}

fn cosine(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let norm = |values: &[f32]| values.iter().map(|v| v * v).sum::<f32>().sqrt();
    let denominator = norm(left) * norm(right);
    if denominator == 0.0 {
        0.0
    } else {
        dot / denominator
    }
}
