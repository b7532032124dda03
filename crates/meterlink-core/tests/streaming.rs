//! Prompt streaming over encrypted and plaintext sessions.

use meterlink_config::{EncryptionConfig, EngineConfig, HandshakePolicy};
use meterlink_core::{CompletionOutcome, EngineError, PromptOptions};
use meterlink_protocol::{ClientMessage, ErrorCode, EventPayload, SessionId, TokenUsage};
use meterlink_test_utils::{Harness, HostFrame, PromptReply, wait_until};
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn started(harness: &Harness, encryption: bool) -> SessionId {
    harness
        .engine
        .start_session(harness.request(encryption))
        .await
        .expect("start session")
        .session_id
}

fn usage(prompt: u64, completion: u64, window: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens: Some(prompt),
        completion_tokens: Some(completion),
        context_window_size: Some(window),
        ..TokenUsage::default()
    }
}

#[tokio::test]
async fn encrypted_prompt_streams_deltas_and_records_exchange() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness
        .host
        .push_reply(PromptReply::stream(&["Hel", "lo ", "there"], None));

    let completion = harness
        .engine
        .send_prompt_streaming(session_id, "Say hello", PromptOptions::default())
        .await
        .expect("prompt");

    assert_eq!(completion.content, "Hello there");
    assert_eq!(completion.outcome, CompletionOutcome::Finished);
    assert_eq!(completion.usage.llm_tokens, 3);
    assert_eq!(harness.sink.deltas(), vec!["Hel", "lo ", "there"]);

    let prompts = harness.host.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].payload.prompt, "Say hello");
    assert_eq!(prompts[0].payload.model, "llama-3.1-8b");
    assert!(prompts[0].payload.stream);
    assert_eq!(prompts[0].request_id, completion.request_id);

    let record = harness.engine.session(session_id).expect("record");
    assert_eq!(record.prompts, vec!["Say hello"]);
    assert_eq!(record.responses, vec!["Hello there"]);
    assert_eq!(record.total_tokens, 3);
}

#[tokio::test]
async fn prompt_text_never_travels_in_clear_on_encrypted_sessions() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;

    harness
        .engine
        .send_prompt(session_id, "top secret question", PromptOptions::default())
        .await
        .expect("prompt");

    let frames = harness.host.frames();
    assert!(frames.iter().all(|frame| !matches!(frame, ClientMessage::Prompt { .. })));
    for frame in &frames {
        let wire = serde_json::to_string(frame).expect("encode");
        assert!(!wire.contains("top secret question"));
    }
}

#[tokio::test]
async fn per_operation_policy_rehandshakes_and_resets_message_index() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;

    for prompt in ["one", "two"] {
        harness
            .engine
            .send_prompt(session_id, prompt, PromptOptions::default())
            .await
            .expect("prompt");
    }

    assert_eq!(harness.host.handshakes().len(), 3);
    let indices: Vec<Option<u64>> = harness
        .host
        .prompts()
        .iter()
        .map(|prompt| prompt.index)
        .collect();
    assert_eq!(indices, vec![Some(0), Some(0)]);
    assert_eq!(
        harness.host.frame_types(),
        vec![
            "encrypted_session_init",
            "encrypted_session_init",
            "encrypted_message",
            "encrypted_session_init",
            "encrypted_message",
        ]
    );
    // One lookup; later handshakes hit the cache.
    assert_eq!(harness.host_keys.calls(), 1);
}

#[tokio::test]
async fn per_connection_policy_keeps_key_and_advances_index() {
    let config = EngineConfig::builder()
        .encryption(EncryptionConfig {
            handshake_policy: HandshakePolicy::PerConnection,
            ..EncryptionConfig::default()
        })
        .build();
    let harness = Harness::with_config(config);
    let session_id = started(&harness, true).await;

    for prompt in ["one", "two", "three"] {
        harness
            .engine
            .send_prompt(session_id, prompt, PromptOptions::default())
            .await
            .expect("prompt");
    }

    assert_eq!(harness.host.handshakes().len(), 1);
    let indices: Vec<Option<u64>> = harness
        .host
        .prompts()
        .iter()
        .map(|prompt| prompt.index)
        .collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
}

#[tokio::test]
async fn plaintext_prompt_uses_prompt_frames() {
    let harness = Harness::new();
    let session_id = started(&harness, false).await;
    harness
        .host
        .push_reply(PromptReply::new(vec![HostFrame::Content("full answer".to_string())]));

    let completion = harness
        .engine
        .send_prompt(session_id, "question", PromptOptions::default())
        .await
        .expect("prompt");

    assert_eq!(completion.content, "full answer");
    assert_eq!(completion.usage.finish_reason.as_deref(), Some("stop"));
    assert_eq!(harness.host.frame_types(), vec!["session_init", "prompt"]);
    let prompts = harness.host.prompts();
    assert_eq!(prompts[0].index, None);
    assert!(!prompts[0].payload.stream);
    // Non-streaming calls emit no per-chunk deltas.
    assert!(harness.sink.deltas().is_empty());
}

#[tokio::test]
async fn high_context_utilization_emits_a_warning() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;

    harness
        .host
        .push_reply(PromptReply::stream(&["fine"], Some(usage(400, 27, 10_000))));
    let completion = harness
        .engine
        .send_prompt(session_id, "short", PromptOptions::default())
        .await
        .expect("prompt");
    let utilization = completion.usage.context_utilization.expect("utilization");
    assert!((utilization - 0.0427).abs() < 1e-9);
    assert!(harness.sink.warnings().is_empty());

    harness
        .host
        .push_reply(PromptReply::stream(&["full"], Some(usage(800, 54, 1_000))));
    harness
        .engine
        .send_prompt(session_id, "long", PromptOptions::default())
        .await
        .expect("prompt");
    let warnings = harness.sink.warnings();
    assert_eq!(warnings.len(), 1);
    assert!((warnings[0] - 0.854).abs() < 1e-9);
    assert_eq!(
        harness
            .engine
            .session(session_id)
            .expect("record")
            .context_window_size,
        Some(1_000)
    );
}

#[tokio::test(start_paused = true)]
async fn final_chunk_without_terminal_resolves_after_grace() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("par".to_string()),
        HostFrame::FinalChunk("tial".to_string()),
    ]));

    let completion = harness
        .engine
        .send_prompt_streaming(session_id, "hi", PromptOptions::default())
        .await
        .expect("grace resolves");
    assert_eq!(completion.content, "partial");
    assert_eq!(completion.outcome, CompletionOutcome::Finished);
}

#[tokio::test(start_paused = true)]
async fn encrypted_finish_marker_sets_finish_reason() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("done".to_string()),
        HostFrame::Response("length".to_string()),
    ]));

    let completion = harness
        .engine
        .send_prompt_streaming(session_id, "hi", PromptOptions::default())
        .await
        .expect("marker then grace");
    assert_eq!(completion.content, "done");
    assert_eq!(completion.usage.finish_reason.as_deref(), Some("length"));
}

#[tokio::test]
async fn undecryptable_chunk_is_skipped_when_stream_ends() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("a".to_string()),
        HostFrame::CorruptChunk,
        HostFrame::Noise,
        HostFrame::Chunk("c".to_string()),
        HostFrame::End(None),
    ]));

    let completion = harness
        .engine
        .send_prompt_streaming(session_id, "hi", PromptOptions::default())
        .await
        .expect("stream ends normally");
    assert_eq!(completion.content, "ac");
}

#[tokio::test]
async fn stream_of_only_undecryptable_chunks_fails() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::CorruptChunk,
        HostFrame::CorruptChunk,
        HostFrame::Hangup,
    ]));

    let err = harness
        .engine
        .send_prompt_streaming(session_id, "hi", PromptOptions::default())
        .await
        .expect_err("nothing decrypted");
    assert!(matches!(err, EngineError::Decryption { dropped: 2 }));
}

#[tokio::test]
async fn context_limit_errors_carry_window_figures() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness
        .host
        .push_reply(PromptReply::context_limit(40_000, 32_768));

    let err = harness
        .engine
        .send_prompt(session_id, "very long", PromptOptions::default())
        .await
        .expect_err("too long");
    assert_eq!(err.code(), ErrorCode::ContextLimitExceeded);
    match err {
        EngineError::ContextLimit {
            prompt_tokens,
            context_window_size,
            ..
        } => {
            assert_eq!(prompt_tokens, Some(40_000));
            assert_eq!(context_window_size, Some(32_768));
        }
        other => panic!("unexpected error: {other}"),
    }
    // Failed prompts leave no exchange behind.
    assert!(harness.engine.session(session_id).expect("record").prompts.is_empty());
}

#[tokio::test]
async fn host_errors_fail_the_prompt() {
    let harness = Harness::new();
    let session_id = started(&harness, false).await;
    harness
        .host
        .push_reply(PromptReply::error("MODEL_OVERLOADED", "try later"));

    let err = harness
        .engine
        .send_prompt(session_id, "hi", PromptOptions::default())
        .await
        .expect_err("host error");
    match err {
        EngineError::Host { code, message } => {
            assert_eq!(code, "MODEL_OVERLOADED");
            assert_eq!(message, "try later");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_host_times_out_waiting_for_first_chunk() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::silent());

    let err = harness
        .engine
        .send_prompt(session_id, "hi", PromptOptions::default())
        .await
        .expect_err("no answer");
    assert!(matches!(
        err,
        EngineError::TransportTimeout {
            after_ms: 180_000,
            ..
        }
    ));
}

#[tokio::test]
async fn hangup_mid_stream_is_a_transport_error_and_next_prompt_reconnects() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("half".to_string()),
        HostFrame::Hangup,
    ]));

    let err = harness
        .engine
        .send_prompt(session_id, "hi", PromptOptions::default())
        .await
        .expect_err("connection dropped");
    assert!(matches!(err, EngineError::Transport(_)));

    let completion = harness
        .engine
        .send_prompt(session_id, "again", PromptOptions::default())
        .await
        .expect("reconnects");
    assert_eq!(completion.content, "ok");
    assert_eq!(harness.host.connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_returns_partial_content_and_notifies_host() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("partial ".to_string()),
        HostFrame::Chunk("answer".to_string()),
        HostFrame::Pause(Duration::from_secs(30)),
        HostFrame::Chunk(" never seen".to_string()),
        HostFrame::End(None),
    ]));

    let engine = harness.engine.clone();
    let prompt = tokio::spawn(async move {
        engine
            .send_prompt_streaming(session_id, "tell me", PromptOptions::default())
            .await
    });
    let sink = harness.sink.clone();
    wait_until(|| sink.deltas().len() == 2).await;
    harness
        .engine
        .cancel_handle(session_id)
        .expect("cancel handle")
        .cancel();

    let completion = prompt.await.expect("join").expect("cancelled prompt resolves");
    assert!(completion.is_cancelled());
    assert_eq!(completion.content, "partial answer");

    let host = harness.host.clone();
    wait_until(|| host.frame_types().contains(&"stream_cancel")).await;
    assert!(harness.sink.payloads().iter().any(|payload| matches!(
        payload,
        EventPayload::StreamCancelled {
            partial_len: 14,
            ..
        }
    )));
    let record = harness.engine.session(session_id).expect("record");
    assert_eq!(record.responses, vec!["partial answer"]);
    assert_eq!(record.total_tokens, 2);
}

#[tokio::test]
async fn sessions_sharing_an_endpoint_rebind_the_connection() {
    let harness = Harness::new();
    let first = started(&harness, true).await;
    let second = started(&harness, true).await;
    assert_eq!(harness.host.connections(), 2);

    for (session_id, answer) in [(first, "to first"), (second, "to second"), (first, "first again")] {
        harness.host.push_reply(PromptReply::stream(&[answer], None));
        let completion = harness
            .engine
            .send_prompt(session_id, "hi", PromptOptions::default())
            .await
            .expect("prompt");
        assert_eq!(completion.content, answer);
    }

    assert_eq!(harness.host.connections(), 5);
    let sessions: Vec<SessionId> = harness
        .host
        .prompts()
        .iter()
        .map(|prompt| prompt.session_id)
        .collect();
    assert_eq!(sessions, vec![first, second, first]);
}

#[tokio::test]
async fn ending_a_session_mid_stream_cancels_it() {
    let harness = Harness::new();
    let session_id = started(&harness, true).await;
    harness.host.push_reply(PromptReply::new(vec![
        HostFrame::Chunk("so far".to_string()),
        HostFrame::Pause(Duration::from_secs(30)),
        HostFrame::End(None),
    ]));

    let engine = harness.engine.clone();
    let prompt = tokio::spawn(async move {
        engine
            .send_prompt_streaming(session_id, "long task", PromptOptions::default())
            .await
    });
    let sink = harness.sink.clone();
    wait_until(|| sink.deltas().len() == 1).await;

    harness.engine.end_session(session_id).await.expect("end");
    let completion = prompt.await.expect("join").expect("stream resolves");
    assert!(completion.is_cancelled());
    assert_eq!(completion.content, "so far");

    // The ended record is left as teardown found it.
    let record = harness.engine.session(session_id).expect("record");
    assert!(record.prompts.is_empty());
    assert!(record.responses.is_empty());
    assert_eq!(record.total_tokens, 0);
}
