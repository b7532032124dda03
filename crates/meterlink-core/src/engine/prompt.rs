use super::SessionEngine;
use crate::assembler::{Assembler, StreamDecoder, StreamTimeouts};
use crate::error::EngineError;
use crate::transport::Connection;
use crate::types::{Completion, ConversationMessage, PromptOptions, Role, SessionRecord};
use log::{debug, info, warn};
use meterlink_protocol::{
    ClientMessage, EventMsg, EventPayload, PromptPayload, RequestId, SessionId,
};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

impl SessionEngine {
    /// Send a prompt and emit `TokenDelta` events while it streams.
    ///
    /// Resolves once with the accumulated content. Cancelling through
    /// [`SessionEngine::cancel_handle`] resolves with the partial content.
    pub async fn send_prompt_streaming(
        &self,
        session_id: SessionId,
        prompt: &str,
        options: PromptOptions,
    ) -> Result<Completion, EngineError> {
        self.run_prompt(session_id, prompt, options, true).await
    }

    /// Send a prompt and return the whole response.
    pub async fn send_prompt(
        &self,
        session_id: SessionId,
        prompt: &str,
        options: PromptOptions,
    ) -> Result<Completion, EngineError> {
        self.run_prompt(session_id, prompt, options, false).await
    }

    async fn run_prompt(
        &self,
        session_id: SessionId,
        prompt: &str,
        options: PromptOptions,
        streaming: bool,
    ) -> Result<Completion, EngineError> {
        let ended = self.end_token(session_id);
        let (record, mut lease) = tokio::select! {
            biased;
            _ = ended.cancelled() => return Err(EngineError::SessionEnded(session_id)),
            prepared = self.prepare(session_id) => prepared?,
        };
        let cancel = self.stream_token(session_id);
        // Teardown may have run between the lease and the token insert.
        if ended.is_cancelled() {
            cancel.cancel();
        }
        let result = self
            .stream_prompt(&record, &mut lease, prompt, options, streaming, &cancel)
            .await;
        self.clear_stream_token(session_id);
        drop(lease);

        let completion = result?;
        if ended.is_cancelled() {
            debug!(
                "session ended during prompt, exchange not recorded (session_id={}, request_id={})",
                session_id, completion.request_id
            );
            return Ok(completion);
        }
        self.store.apply_usage(session_id, &completion.usage)?;
        self.store
            .append_exchange(session_id, prompt, &completion.content)?;
        if self.config.storage.persist_conversations {
            self.persist_exchange(session_id, prompt, &completion.content)
                .await;
        }
        Ok(completion)
    }

    async fn stream_prompt(
        &self,
        record: &SessionRecord,
        connection: &mut Connection,
        prompt: &str,
        options: PromptOptions,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<Completion, EngineError> {
        let session_id = record.session_id;
        let encrypted = record.encryption_enabled;
        let request_id = RequestId::new();
        let payload = PromptPayload {
            prompt: prompt.to_string(),
            model: record.model.clone(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream: streaming,
            images: options.images,
            thinking: options.thinking,
        };
        let message = if encrypted {
            let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
            let frame = connection
                .encryption
                .seal(session_id, self.crypto.as_ref(), &plaintext)?;
            ClientMessage::EncryptedMessage {
                id: request_id.clone(),
                session_id,
                payload: frame,
            }
        } else {
            ClientMessage::Prompt {
                id: request_id.clone(),
                session_id,
                job_id: record.job_id,
                request: payload,
            }
        };

        let mut subscription = connection.open_stream(request_id.clone());
        connection.send(&message)?;
        info!(
            "prompt sent (session_id={}, request_id={}, encrypted={}, len={})",
            session_id,
            request_id,
            encrypted,
            prompt.len()
        );

        let completion = {
            let assembler = Assembler {
                session_id,
                request_id: request_id.clone(),
                timeouts: StreamTimeouts::from(&self.config.timeouts),
                sink: self.sink.as_ref(),
                emit_deltas: streaming,
                decoder: encrypted.then(|| StreamDecoder {
                    crypto: self.crypto.as_ref(),
                    encryption: &connection.encryption,
                }),
                warning_threshold: self.config.streaming.context_warning_threshold,
            };
            assembler.run(&mut subscription.receiver, cancel).await?
        };
        drop(subscription);

        if completion.is_cancelled() {
            let notice = ClientMessage::StreamCancel {
                session_id,
                id: Some(request_id.clone()),
                reason: "client_cancelled".to_string(),
            };
            if let Err(err) = connection.send(&notice) {
                debug!(
                    "cancel notice not delivered (session_id={}, err={})",
                    session_id, err
                );
            }
            self.sink.emit(EventMsg::new(
                session_id,
                EventPayload::StreamCancelled {
                    request_id,
                    partial_len: completion.content.len(),
                },
            ));
        }
        Ok(completion)
    }

    async fn persist_exchange(&self, session_id: SessionId, prompt: &str, response: &str) {
        let messages = [
            ConversationMessage::new(Role::User, prompt),
            ConversationMessage::new(Role::Assistant, response),
        ];
        for message in &messages {
            if let Err(err) = self.storage.append_message(session_id, message).await {
                warn!(
                    "failed to persist message (session_id={}, err={})",
                    session_id, err
                );
                return;
            }
        }
    }
}
