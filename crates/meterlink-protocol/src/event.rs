//! Session lifecycle state and events emitted to engine callers.

use crate::ids::{RequestId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a session record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Ended,
}

impl SessionStatus {
    /// Terminal states permit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Ended
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage figures derived when a prompt stream terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageReport {
    /// Text-model tokens, reported by the host or inferred from the stream.
    pub llm_tokens: u64,
    /// Vision-model tokens, when reported.
    pub vlm_tokens: u64,
    /// Sum of the component counts.
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub context_window_size: Option<u64>,
    /// `(prompt + completion) / window`; absent unless all operands are known.
    #[serde(default)]
    pub context_utilization: Option<f64>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Wrapper for events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMsg {
    /// Unique id for the event.
    pub id: Uuid,
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Timestamp when the event was created.
    pub created_at: DateTime<Utc>,
    /// Event payload content.
    pub payload: EventPayload,
}

impl EventMsg {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(session_id: SessionId, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            created_at: Utc::now(),
            payload,
        }
    }
}

/// All events emitted while driving a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum EventPayload {
    /// Session record moved between lifecycle states.
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Streaming content delta for a prompt.
    TokenDelta { request_id: RequestId, delta: String },
    /// Usage derived from a terminal stream message.
    UsageUpdated {
        request_id: RequestId,
        usage: UsageReport,
    },
    /// Context utilization reached the configured threshold.
    ContextWarning {
        request_id: RequestId,
        utilization: f64,
        threshold: f64,
    },
    /// Stream was cancelled by the caller.
    StreamCancelled {
        request_id: RequestId,
        partial_len: usize,
    },
    /// Checkpoint accepted by the payment service.
    CheckpointSubmitted { checkpoint: u64, token_count: u64 },
}

/// Sink interface for session events.
pub trait EventSink: Send + Sync {
    /// Emit an event to downstream listeners.
    fn emit(&self, event: EventMsg);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EventMsg) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn terminal_states_are_closed() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn event_payload_uses_adjacent_tagging() {
        let event = EventMsg::new(
            SessionId(3),
            EventPayload::StatusChanged {
                from: SessionStatus::Pending,
                to: SessionStatus::Active,
            },
        );
        let encoded = serde_json::to_value(&event).expect("serialize");
        assert_eq!(encoded["session_id"], json!("3"));
        assert_eq!(
            encoded["payload"],
            json!({
                "type": "status_changed",
                "payload": { "from": "pending", "to": "active" }
            })
        );
    }
}
