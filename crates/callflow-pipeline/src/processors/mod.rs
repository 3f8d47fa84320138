//! Frame processors making up the per-call chain.

pub mod context;
pub mod context_buffer;
pub mod dispatcher;
pub mod dtmf;
pub mod filler;
pub mod limiter;
pub mod llm;
pub mod recovery;
pub mod router;
pub mod stt;
pub mod summary;
pub mod tts;

pub use context::ContextProcessor;
pub use context_buffer::{ContextBuffer, ContextBufferOptions};
pub use dispatcher::ToolDispatcher;
pub use dtmf::{DtmfDisambiguator, DtmfDisambiguatorConfig};
pub use filler::FillerProcessor;
pub use limiter::{ResponseLimiter, ResponseLimiterConfig};
pub use llm::{AgentProfile, LlmProcessor};
pub use recovery::RecoveryProcessor;
pub use router::{LanguageDetector, RouterProcessor, RouterStrategy};
pub use stt::{SttFactory, SttProcessor};
pub use summary::SummaryProcessor;
pub use tts::{TtsFactory, TtsProcessor};

pub(crate) fn now_pts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
