//! Wire protocol types for the meterlink session engine: transport messages,
//! identifiers, error codes, and session events.

mod code;
mod event;
mod ids;
mod message;

pub use code::ErrorCode;
pub use event::{EventMsg, EventPayload, EventSink, NullSink, SessionStatus, UsageReport};
pub use ids::{ChainId, JobId, RequestId, SessionId};
pub use message::{
    ClientMessage, HostMessage, ImageAttachment, MessageClass, PromptPayload, SealedFrame,
    SealedInitFrame, SessionInitPayload, ThinkingMode, TokenUsage, VectorRecord,
    VectorSearchHit, WebSearchHit,
};
