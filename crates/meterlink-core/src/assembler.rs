//! Streaming response assembly.
//!
//! The assembler owns a single timer and walks the phases
//! `AwaitingFirstByte -> Streaming -> Draining`. Each phase has one timeout:
//! the first-chunk wait, the inter-chunk wait (reset on every message), and
//! the final grace period (armed once when a final signal is seen, never
//! extended). Returning from [`Assembler::run`] is the only way to resolve a
//! request, so later terminal-looking messages are simply never read.

use crate::encryption::{EncryptionContext, InboundLabel};
use crate::error::EngineError;
use crate::types::{Completion, CompletionOutcome};
use log::{debug, warn};
use meterlink_config::TimeoutsConfig;
use meterlink_crypto::CryptoProvider;
use meterlink_protocol::{
    EventMsg, EventPayload, EventSink, HostMessage, RequestId, SealedFrame, SessionId, TokenUsage,
    UsageReport,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstByte,
    Streaming,
    Draining,
}

impl Phase {
    fn operation(self) -> &'static str {
        match self {
            Phase::AwaitingFirstByte => "first_chunk",
            Phase::Streaming => "inter_chunk",
            Phase::Draining => "final_grace",
        }
    }
}

/// Timeout per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamTimeouts {
    pub first_chunk: Duration,
    pub inter_chunk: Duration,
    pub final_grace: Duration,
}

impl StreamTimeouts {
    fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::AwaitingFirstByte => self.first_chunk,
            Phase::Streaming => self.inter_chunk,
            Phase::Draining => self.final_grace,
        }
    }
}

impl From<&TimeoutsConfig> for StreamTimeouts {
    fn from(config: &TimeoutsConfig) -> Self {
        Self {
            first_chunk: config.first_chunk(),
            inter_chunk: config.inter_chunk(),
            final_grace: config.final_grace(),
        }
    }
}

/// Opens encrypted stream frames with the session's active key.
pub(crate) struct StreamDecoder<'a> {
    pub crypto: &'a dyn CryptoProvider,
    pub encryption: &'a EncryptionContext,
}

enum Step {
    Continue,
    Done,
}

#[derive(Default)]
struct StreamState {
    buffer: String,
    chunk_count: u64,
    token_sum: u64,
    dropped: usize,
    /// Labels of chunks already accepted in this stream.
    seen: HashSet<InboundLabel>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

/// Drives one prompt stream to its single resolution.
pub(crate) struct Assembler<'a> {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub timeouts: StreamTimeouts,
    pub sink: &'a dyn EventSink,
    /// Emit `TokenDelta` events as content arrives.
    pub emit_deltas: bool,
    pub decoder: Option<StreamDecoder<'a>>,
    pub warning_threshold: f64,
}

impl Assembler<'_> {
    pub(crate) async fn run(
        &self,
        receiver: &mut mpsc::UnboundedReceiver<HostMessage>,
        cancel: &CancellationToken,
    ) -> Result<Completion, EngineError> {
        let mut state = StreamState::default();
        let mut phase = Phase::AwaitingFirstByte;
        let timer = tokio::time::sleep(self.timeouts.first_chunk);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        "stream cancelled (session_id={}, request_id={}, partial_len={})",
                        self.session_id,
                        self.request_id,
                        state.buffer.len()
                    );
                    return Ok(self.finish(state, CompletionOutcome::Cancelled));
                }
                _ = &mut timer => {
                    if phase == Phase::Draining {
                        debug!(
                            "grace period elapsed without terminal message (session_id={}, request_id={})",
                            self.session_id, self.request_id
                        );
                        return Ok(self.finish(state, CompletionOutcome::Finished));
                    }
                    if state.dropped > 0 {
                        return Err(EngineError::Decryption { dropped: state.dropped });
                    }
                    let after = self.timeouts.for_phase(phase);
                    warn!(
                        "stream timed out (session_id={}, request_id={}, phase={}, after_ms={})",
                        self.session_id,
                        self.request_id,
                        phase.operation(),
                        after.as_millis()
                    );
                    return Err(EngineError::TransportTimeout {
                        operation: phase.operation(),
                        after_ms: after.as_millis() as u64,
                    });
                }
                message = receiver.recv() => {
                    let Some(message) = message else {
                        if phase == Phase::Draining {
                            return Ok(self.finish(state, CompletionOutcome::Finished));
                        }
                        if state.dropped > 0 {
                            return Err(EngineError::Decryption { dropped: state.dropped });
                        }
                        return Err(EngineError::Transport(
                            "connection closed before the stream finished".to_string(),
                        ));
                    };
                    let previous = phase;
                    if let Step::Done = self.apply(&mut state, &mut phase, message)? {
                        return Ok(self.finish(state, CompletionOutcome::Finished));
                    }
                    if phase != Phase::Draining || previous != Phase::Draining {
                        timer
                            .as_mut()
                            .reset(Instant::now() + self.timeouts.for_phase(phase));
                    }
                }
            }
        }
    }

    fn apply(
        &self,
        state: &mut StreamState,
        phase: &mut Phase,
        message: HostMessage,
    ) -> Result<Step, EngineError> {
        match message {
            HostMessage::StreamChunk { .. } if self.decoder.is_some() => {
                warn!(
                    "dropping plaintext chunk on encrypted session (session_id={}, request_id={})",
                    self.session_id, self.request_id
                );
                Ok(Step::Continue)
            }
            HostMessage::StreamChunk {
                content,
                tokens,
                is_final,
                ..
            } => {
                self.push_chunk(state, &content, tokens);
                advance(phase, is_final);
                Ok(Step::Continue)
            }
            HostMessage::EncryptedChunk {
                payload,
                tokens,
                is_final,
                ..
            } => {
                match self.open_chunk(state, &payload) {
                    Ok(content) => self.push_chunk(state, &content, tokens),
                    Err(err) => {
                        state.dropped += 1;
                        warn!(
                            "dropping undecryptable chunk (session_id={}, request_id={}, index={:?}, err={})",
                            self.session_id, self.request_id, payload.index, err
                        );
                    }
                }
                advance(phase, is_final);
                Ok(Step::Continue)
            }
            HostMessage::Response {
                content,
                finish_reason,
                usage,
                ..
            } => {
                let complete_answer = state.chunk_count == 0 && state.dropped == 0;
                if self.decoder.is_some() && !content.is_empty() {
                    warn!(
                        "ignoring plaintext response content on encrypted session (session_id={}, request_id={})",
                        self.session_id, self.request_id
                    );
                } else if state.buffer.is_empty() && !content.is_empty() {
                    self.emit_delta(&content);
                    state.buffer = content;
                }
                if let Some(usage) = usage {
                    merge_usage(&mut state.usage, &usage);
                }
                if finish_reason.is_some() {
                    state.finish_reason = finish_reason;
                }
                if complete_answer {
                    return Ok(Step::Done);
                }
                *phase = Phase::Draining;
                Ok(Step::Continue)
            }
            HostMessage::EncryptedResponse { payload, .. } => {
                let marker = self.open_text(&payload).and_then(|(label, reason)| match label {
                    InboundLabel::ResponseFinal => Ok(reason),
                    other => Err(EngineError::UnexpectedResponse(format!(
                        "response marker labelled {other:?}"
                    ))),
                });
                match marker {
                    Ok(reason) if !reason.trim().is_empty() => {
                        state.finish_reason = Some(reason.trim().to_string());
                    }
                    Ok(_) => {}
                    Err(err) => warn!(
                        "dropping undecryptable response marker (session_id={}, request_id={}, err={})",
                        self.session_id, self.request_id, err
                    ),
                }
                *phase = Phase::Draining;
                Ok(Step::Continue)
            }
            HostMessage::StreamEnd {
                usage,
                finish_reason,
                ..
            } => {
                if let Some(usage) = usage {
                    merge_usage(&mut state.usage, &usage);
                }
                if finish_reason.is_some() {
                    state.finish_reason = finish_reason;
                }
                Ok(Step::Done)
            }
            error @ HostMessage::Error { .. } => Err(EngineError::from_host_message(&error)),
            other => {
                debug!(
                    "ignoring non-stream message (session_id={}, type={})",
                    self.session_id,
                    other.type_name()
                );
                Ok(Step::Continue)
            }
        }
    }

    fn push_chunk(&self, state: &mut StreamState, content: &str, tokens: Option<u64>) {
        state.chunk_count += 1;
        state.token_sum = state.token_sum.saturating_add(tokens.unwrap_or(0));
        if !content.is_empty() {
            state.buffer.push_str(content);
            self.emit_delta(content);
        }
    }

    fn emit_delta(&self, delta: &str) {
        if self.emit_deltas {
            self.sink.emit(EventMsg::new(
                self.session_id,
                EventPayload::TokenDelta {
                    request_id: self.request_id.clone(),
                    delta: delta.to_string(),
                },
            ));
        }
    }

    fn open_text(&self, frame: &SealedFrame) -> Result<(InboundLabel, String), EngineError> {
        let decoder = self
            .decoder
            .as_ref()
            .ok_or(EngineError::EncryptionNotReady(self.session_id))?;
        let (label, plaintext) = decoder
            .encryption
            .open(self.session_id, decoder.crypto, frame)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| EngineError::UnexpectedResponse("chunk is not valid utf-8".to_string()))?;
        Ok((label, text))
    }

    /// Open a content chunk; its label must be new to this stream.
    fn open_chunk(&self, state: &mut StreamState, frame: &SealedFrame) -> Result<String, EngineError> {
        let (label, text) = self.open_text(frame)?;
        if label == InboundLabel::ResponseFinal {
            return Err(EngineError::UnexpectedResponse(
                "response marker sent as a chunk".to_string(),
            ));
        }
        if !state.seen.insert(label) {
            return Err(EngineError::UnexpectedResponse(format!(
                "repeated chunk {label:?}"
            )));
        }
        Ok(text)
    }

    fn finish(&self, state: StreamState, outcome: CompletionOutcome) -> Completion {
        let usage = derive_usage(&state);
        if outcome == CompletionOutcome::Finished {
            self.sink.emit(EventMsg::new(
                self.session_id,
                EventPayload::UsageUpdated {
                    request_id: self.request_id.clone(),
                    usage: usage.clone(),
                },
            ));
            if let Some(utilization) = usage.context_utilization
                && utilization >= self.warning_threshold
            {
                warn!(
                    "context window nearly exhausted (session_id={}, utilization={:.3}, threshold={})",
                    self.session_id, utilization, self.warning_threshold
                );
                self.sink.emit(EventMsg::new(
                    self.session_id,
                    EventPayload::ContextWarning {
                        request_id: self.request_id.clone(),
                        utilization,
                        threshold: self.warning_threshold,
                    },
                ));
            }
        }
        Completion {
            request_id: self.request_id.clone(),
            content: state.buffer,
            outcome,
            usage,
        }
    }
}

/// Phase after a chunk arrives.
fn advance(phase: &mut Phase, is_final: bool) {
    if is_final {
        *phase = Phase::Draining;
    } else if *phase == Phase::AwaitingFirstByte {
        *phase = Phase::Streaming;
    }
}

fn merge_usage(into: &mut TokenUsage, from: &TokenUsage) {
    into.prompt_tokens = from.prompt_tokens.or(into.prompt_tokens);
    into.completion_tokens = from.completion_tokens.or(into.completion_tokens);
    into.total_tokens = from.total_tokens.or(into.total_tokens);
    into.context_window_size = from.context_window_size.or(into.context_window_size);
    into.llm_tokens = from.llm_tokens.or(into.llm_tokens);
    into.vlm_tokens = from.vlm_tokens.or(into.vlm_tokens);
}

/// Reported figures win; otherwise text tokens are inferred from the stream.
fn derive_usage(state: &StreamState) -> UsageReport {
    let reported = state.usage;
    let inferred = if state.token_sum > 0 {
        state.token_sum
    } else {
        state.chunk_count
    };
    let llm_tokens = reported
        .llm_tokens
        .or(reported.completion_tokens)
        .unwrap_or(inferred);
    let vlm_tokens = reported.vlm_tokens.unwrap_or(0);
    let context_utilization = match (
        reported.prompt_tokens,
        reported.completion_tokens,
        reported.context_window_size,
    ) {
        (Some(prompt), Some(completion), Some(window)) if window > 0 => {
            Some(prompt.saturating_add(completion) as f64 / window as f64)
        }
        _ => None,
    };
    UsageReport {
        llm_tokens,
        vlm_tokens,
        total_tokens: llm_tokens.saturating_add(vlm_tokens),
        prompt_tokens: reported.prompt_tokens,
        completion_tokens: reported.completion_tokens,
        context_window_size: reported.context_window_size,
        context_utilization,
        finish_reason: state.finish_reason.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingSink;
    use meterlink_crypto::{SealedBox, Secp256k1Crypto, SessionKey, aead_encrypt, random_nonce};
    use pretty_assertions::assert_eq;

    const TIMEOUTS: StreamTimeouts = StreamTimeouts {
        first_chunk: Duration::from_secs(180),
        inter_chunk: Duration::from_secs(60),
        final_grace: Duration::from_secs(3),
    };

    fn assembler<'a>(sink: &'a CollectingSink, decoder: Option<StreamDecoder<'a>>) -> Assembler<'a> {
        Assembler {
            session_id: SessionId(1),
            request_id: RequestId::from("req"),
            timeouts: TIMEOUTS,
            sink,
            emit_deltas: true,
            decoder,
            warning_threshold: 0.8,
        }
    }

    fn chunk(content: &str, is_final: bool) -> HostMessage {
        HostMessage::StreamChunk {
            id: Some(RequestId::from("req")),
            content: content.to_string(),
            tokens: None,
            is_final,
        }
    }

    fn stream_end(usage: Option<TokenUsage>) -> HostMessage {
        HostMessage::StreamEnd {
            id: Some(RequestId::from("req")),
            usage,
            finish_reason: Some("stop".to_string()),
        }
    }

    fn sealed(key: &SessionKey, text: &str, aad: &str) -> SealedFrame {
        let nonce = random_nonce();
        let ciphertext = aead_encrypt(key, &nonce, text.as_bytes(), aad.as_bytes()).expect("encrypt");
        SealedBox {
            ciphertext,
            nonce: nonce.to_vec(),
            aad: aad.as_bytes().to_vec(),
        }
        .to_frame(None)
    }

    fn ready_context(key: &SessionKey) -> EncryptionContext {
        let mut context = EncryptionContext::default();
        context.begin(key.clone());
        context.acknowledge();
        context
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_despite_several_terminal_messages() {
        let key = SessionKey::random();
        let crypto = Secp256k1Crypto::generate();
        let context = ready_context(&key);
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&key, "Hel", "chunk_0"),
            tokens: None,
            is_final: false,
        })
        .expect("send");
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&key, "lo", "chunk_1"),
            tokens: None,
            is_final: true,
        })
        .expect("send");
        tx.send(HostMessage::EncryptedResponse {
            id: None,
            payload: sealed(&key, "length", "encrypted_response_final"),
        })
        .expect("send");
        tx.send(stream_end(None)).expect("send");
        tx.send(stream_end(None)).expect("send");

        let decoder = StreamDecoder {
            crypto: &crypto,
            encryption: &context,
        };
        let completion = assembler(&sink, Some(decoder))
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");

        assert_eq!(completion.content, "Hello");
        assert_eq!(completion.outcome, CompletionOutcome::Finished);
        assert_eq!(completion.usage.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.llm_tokens, 2);
        assert!(rx.try_recv().is_ok(), "second stream_end stays unread");
        let usage_events = sink
            .payloads()
            .into_iter()
            .filter(|payload| matches!(payload, EventPayload::UsageUpdated { .. }))
            .count();
        assert_eq!(usage_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_resolves_without_terminal_message() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("partial ", false)).expect("send");
        tx.send(chunk("answer", true)).expect("send");

        let started = Instant::now();
        let completion = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(completion.content, "partial answer");
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_timeout_is_long() {
        let sink = CollectingSink::default();
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let err = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransportTimeout {
                operation: "first_chunk",
                after_ms: 180_000
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn inter_chunk_window_follows_first_chunk() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("a", false)).expect("send");
        let err = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransportTimeout {
                operation: "inter_chunk",
                ..
            }
        ));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_resolves_with_partial_content() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("so far", false)).expect("send");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let completion = assembler(&sink, None)
            .run(&mut rx, &cancel)
            .await
            .expect("cancellation never fails");
        assert!(completion.is_cancelled());
        assert_eq!(completion.content, "so far");
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn undecryptable_stream_without_terminal_fails() {
        let crypto = Secp256k1Crypto::generate();
        let context = ready_context(&SessionKey::random());
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&SessionKey::random(), "secret", "chunk_0"),
            tokens: None,
            is_final: false,
        })
        .expect("send");

        let decoder = StreamDecoder {
            crypto: &crypto,
            encryption: &context,
        };
        let err = assembler(&sink, Some(decoder))
            .run(&mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Decryption { dropped: 1 }));
        drop(tx);
    }

    #[tokio::test]
    async fn dropped_chunk_is_tolerated_when_terminal_arrives() {
        let key = SessionKey::random();
        let crypto = Secp256k1Crypto::generate();
        let context = ready_context(&key);
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&SessionKey::random(), "lost", "chunk_0"),
            tokens: None,
            is_final: false,
        })
        .expect("send");
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&key, "kept", "chunk_1"),
            tokens: None,
            is_final: false,
        })
        .expect("send");
        tx.send(stream_end(None)).expect("send");

        let decoder = StreamDecoder {
            crypto: &crypto,
            encryption: &context,
        };
        let completion = assembler(&sink, Some(decoder))
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(completion.content, "kept");
    }

    #[tokio::test]
    async fn low_utilization_does_not_warn() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("Hi", false)).expect("send");
        tx.send(stream_end(Some(TokenUsage {
            prompt_tokens: Some(1250),
            completion_tokens: Some(150),
            context_window_size: Some(32768),
            ..TokenUsage::default()
        })))
        .expect("send");

        let completion = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        let utilization = completion.usage.context_utilization.expect("utilization");
        assert!((utilization - 0.0427).abs() < 0.0001);
        assert_eq!(completion.usage.llm_tokens, 150);
        assert!(
            !sink
                .payloads()
                .iter()
                .any(|payload| matches!(payload, EventPayload::ContextWarning { .. }))
        );
    }

    #[tokio::test]
    async fn high_utilization_warns() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(stream_end(Some(TokenUsage {
            prompt_tokens: Some(27_000),
            completion_tokens: Some(1_000),
            context_window_size: Some(32_768),
            ..TokenUsage::default()
        })))
        .expect("send");

        assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        let warning = sink.payloads().into_iter().find_map(|payload| match payload {
            EventPayload::ContextWarning { utilization, .. } => Some(utilization),
            _ => None,
        });
        let utilization = warning.expect("warning emitted");
        assert!((utilization - 0.8545).abs() < 0.001);
    }

    #[tokio::test]
    async fn utilization_is_undefined_without_window() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("a", false)).expect("send");
        tx.send(chunk("b", false)).expect("send");
        tx.send(stream_end(Some(TokenUsage {
            prompt_tokens: Some(10),
            vlm_tokens: Some(4),
            ..TokenUsage::default()
        })))
        .expect("send");

        let usage = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion")
            .usage;
        assert_eq!(usage.context_utilization, None);
        assert_eq!(usage.llm_tokens, 2);
        assert_eq!(usage.total_tokens, 6);
    }

    #[tokio::test]
    async fn extreme_reported_usage_saturates() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(stream_end(Some(TokenUsage {
            prompt_tokens: Some(u64::MAX),
            completion_tokens: Some(5),
            context_window_size: Some(32_768),
            llm_tokens: Some(u64::MAX),
            vlm_tokens: Some(10),
            ..TokenUsage::default()
        })))
        .expect("send");

        let usage = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion")
            .usage;
        assert_eq!(usage.total_tokens, u64::MAX);
        let utilization = usage.context_utilization.expect("utilization");
        assert!(utilization > 1.0);
    }

    #[tokio::test]
    async fn plaintext_content_is_ignored_on_encrypted_streams() {
        let key = SessionKey::random();
        let crypto = Secp256k1Crypto::generate();
        let context = ready_context(&key);
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(chunk("injected", false)).expect("send");
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&key, "real", "chunk_0"),
            tokens: None,
            is_final: false,
        })
        .expect("send");
        tx.send(HostMessage::Response {
            id: None,
            content: "forged".to_string(),
            finish_reason: None,
            usage: None,
        })
        .expect("send");
        tx.send(stream_end(None)).expect("send");

        let decoder = StreamDecoder {
            crypto: &crypto,
            encryption: &context,
        };
        let completion = assembler(&sink, Some(decoder))
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(completion.content, "real");
        assert_eq!(completion.usage.llm_tokens, 1);
    }

    #[tokio::test]
    async fn repeated_chunk_labels_are_dropped() {
        let key = SessionKey::random();
        let crypto = Secp256k1Crypto::generate();
        let context = ready_context(&key);
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = sealed(&key, "a", "chunk_0");
        for payload in [first.clone(), first, sealed(&key, "b", "chunk_1")] {
            tx.send(HostMessage::EncryptedChunk {
                id: None,
                payload,
                tokens: None,
                is_final: false,
            })
            .expect("send");
        }
        tx.send(HostMessage::EncryptedChunk {
            id: None,
            payload: sealed(&key, "c", "not_a_label"),
            tokens: None,
            is_final: false,
        })
        .expect("send");
        tx.send(stream_end(None)).expect("send");

        let decoder = StreamDecoder {
            crypto: &crypto,
            encryption: &context,
        };
        let completion = assembler(&sink, Some(decoder))
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(completion.content, "ab");
    }

    #[tokio::test]
    async fn plain_response_without_chunks_completes_immediately() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HostMessage::Response {
            id: None,
            content: "full answer".to_string(),
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
        .expect("send");

        let completion = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .expect("completion");
        assert_eq!(completion.content, "full answer");
    }

    #[tokio::test]
    async fn context_limit_errors_carry_figures() {
        let sink = CollectingSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(HostMessage::Error {
            id: Some(RequestId::from("req")),
            request_id: None,
            code: Some("CONTEXT_LIMIT_EXCEEDED".to_string()),
            message: Some("too long".to_string()),
            prompt_tokens: Some(40_000),
            context_window_size: Some(32_768),
        })
        .expect("send");

        let err = assembler(&sink, None)
            .run(&mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ContextLimit {
                prompt_tokens: Some(40_000),
                context_window_size: Some(32_768),
                ..
            }
        ));
    }
}
