//! Shared session, prompt, and conversation types.

use chrono::{DateTime, Utc};
use meterlink_protocol::{
    ChainId, ImageAttachment, JobId, RequestId, SessionId, SessionStatus, ThinkingMode,
    UsageReport, VectorSearchHit,
};
use serde::{Deserialize, Serialize};

/// Vector database handle bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RagContext {
    pub vector_db_id: String,
}

/// Authoritative record of one session. Only the session store mutates it;
/// callers receive snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub chain_id: ChainId,
    pub model: String,
    /// Host address the session was opened with.
    pub provider: String,
    /// Transport endpoint of the host.
    pub endpoint: String,
    pub status: SessionStatus,
    pub price_per_token: u64,
    pub encryption_enabled: bool,
    pub prompts: Vec<String>,
    pub responses: Vec<String>,
    pub total_tokens: u64,
    pub last_token_usage: Option<UsageReport>,
    pub context_window_size: Option<u64>,
    pub last_finish_reason: Option<String>,
    pub rag_context: Option<RagContext>,
    /// Last checkpoint number acknowledged by the payment service.
    pub last_checkpoint: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartSessionRequest {
    pub chain_id: ChainId,
    /// Host address; used for job creation and public key lookup.
    pub host_address: String,
    /// Transport endpoint, e.g. `ws://host:8080/v1/ws`.
    pub endpoint: String,
    pub model: String,
    pub price_per_token: u64,
    /// Escrowed deposit in the payment token's smallest unit.
    pub deposit: u64,
    /// Tokens between proof submissions.
    pub proof_interval: u64,
    pub duration_secs: u64,
    pub encryption: bool,
    /// Pre-existing vector database to attach.
    pub vector_database: Option<String>,
}

impl StartSessionRequest {
    /// Request with conservative defaults; encryption on.
    pub fn new(
        chain_id: ChainId,
        host_address: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            chain_id,
            host_address: host_address.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            price_per_token: 0,
            deposit: 0,
            proof_interval: 1_000,
            duration_secs: 3_600,
            encryption: true,
            vector_database: None,
        }
    }

    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_price_per_token(mut self, price_per_token: u64) -> Self {
        self.price_per_token = price_per_token;
        self
    }

    pub fn with_deposit(mut self, deposit: u64) -> Self {
        self.deposit = deposit;
        self
    }

    pub fn with_vector_database(mut self, vector_db_id: impl Into<String>) -> Self {
        self.vector_database = Some(vector_db_id.into());
        self
    }
}

/// Per-prompt generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub images: Vec<ImageAttachment>,
    pub thinking: Option<ThinkingMode>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4_000,
            temperature: 0.7,
            images: Vec::new(),
            thinking: None,
        }
    }
}

/// How a prompt stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// Terminal message or grace expiry after a final signal.
    Finished,
    /// Caller cancelled; content is whatever arrived before cancellation.
    Cancelled,
}

/// Single resolution of a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request_id: RequestId,
    pub content: String,
    pub outcome: CompletionOutcome,
    pub usage: UsageReport,
}

impl Completion {
    pub fn is_cancelled(&self) -> bool {
        self.outcome == CompletionOutcome::Cancelled
    }
}

/// Aggregate of a batched vector upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub batches: usize,
    pub uploaded: usize,
    pub rejected: usize,
    pub errors: Vec<String>,
}

/// Similarity search results, highest score first.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    pub hits: Vec<VectorSearchHit>,
    pub total_results: usize,
    pub search_time_ms: f64,
}

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a persisted or recovered conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Continuation of the previous assistant message cut at a checkpoint.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            partial: false,
        }
    }
}

/// Conversation stored through the storage service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredConversation {
    pub session_id: SessionId,
    pub messages: Vec<ConversationMessage>,
    pub updated_at: DateTime<Utc>,
}
