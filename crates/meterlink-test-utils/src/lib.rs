//! Test helpers shared across meterlink crates.

pub mod checkpoint;
pub mod harness;
pub mod host;
pub mod services;
pub mod sink;

pub use checkpoint::CheckpointFixture;
pub use harness::{CHAIN_ID, ENDPOINT, HOST_ADDRESS, Harness, wait_until};
pub use host::{AckMode, HostFrame, MockHost, PromptReply, ReceivedHandshake, ReceivedPrompt};
pub use services::{
    StaticHostKeys, StubCheckpointSource, StubPaymentService, StubStorageService,
};
pub use sink::RecordingSink;
