//! Core types for the callflow voice-agent runtime.
//!
//! This crate provides the foundation shared by every other crate:
//! - The frame model flowing through per-call pipelines (audio, text,
//!   control, system, image) with pooled payload buffers
//! - Reserved frame metadata keys
//! - The error taxonomy with machine-readable reason codes
//! - Resilience primitives (circuit breaker, retry policy)
//! - PII redaction for log surfaces
//! - Capability traits for processors, transports and vendor sessions

pub mod error;
pub mod frame;
pub mod meta;
pub mod redact;
pub mod resilience;
pub mod traits;

pub use error::{Error, ReasonCode, Result};
pub use frame::{
    audio_pool_stats, image_pool_stats, release_frame, ControlCode, Frame, FrameKind, Meta,
    PoolStats, PtsGenerator,
};
pub use resilience::{CircuitBreaker, RetryPolicy};
pub use traits::{
    llm::{
        ChatMessage, ContentPart, LlmAdapter, LlmContext, LlmResponse, Role, TokenStream,
        TokenUsage, ToolCall, ToolRegistry, ToolSpec,
    },
    processor::FrameProcessor,
    stt::StreamingStt,
    transport::{DtmfSender, OutboundDialer, ReadyReporter, Transport},
    tts::StreamingTts,
};
