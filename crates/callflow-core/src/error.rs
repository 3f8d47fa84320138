//! Error taxonomy.
//!
//! Every error that crosses a component boundary carries a machine-readable
//! [`ReasonCode`]. Attaching a reason to an already-reasoned error is a
//! no-op so outer code never masks the inner cause. Rate-limit failures are
//! a distinct kind that circuit breakers recognize through any wrapping.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Short machine-readable error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    Unknown,
    SttConnect,
    SttSend,
    SttRetry,
    SttRateLimit,
    SttCircuitOpen,
    TtsConnect,
    TtsSend,
    TtsRetry,
    TtsRateLimit,
    TtsCircuitOpen,
    LlmGenerate,
    LlmStream,
    LlmRateLimit,
    WebhookInvalidSignature,
    TransportSend,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Unknown => "unknown",
            ReasonCode::SttConnect => "stt_connect",
            ReasonCode::SttSend => "stt_send",
            ReasonCode::SttRetry => "stt_retry",
            ReasonCode::SttRateLimit => "stt_rate_limit",
            ReasonCode::SttCircuitOpen => "stt_circuit_open",
            ReasonCode::TtsConnect => "tts_connect",
            ReasonCode::TtsSend => "tts_send",
            ReasonCode::TtsRetry => "tts_retry",
            ReasonCode::TtsRateLimit => "tts_rate_limit",
            ReasonCode::TtsCircuitOpen => "tts_circuit_open",
            ReasonCode::LlmGenerate => "llm_generate",
            ReasonCode::LlmStream => "llm_stream",
            ReasonCode::LlmRateLimit => "llm_rate_limit",
            ReasonCode::WebhookInvalidSignature => "webhook_invalid_signature",
            ReasonCode::TransportSend => "transport_send",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// An inner error tagged with a reason code.
    #[error("{source}")]
    Reasoned {
        reason: ReasonCode,
        #[source]
        source: Box<Error>,
    },

    /// Provider signalled a rate limit. Flows through circuit breakers.
    #[error("rate limit: {message}")]
    RateLimit { provider: String, message: String },

    /// Vendor session or adapter failure.
    #[error("vendor: {0}")]
    Vendor(String),

    /// Tool execution failed.
    #[error("tool: {0}")]
    Tool(String),

    /// Tool execution exceeded its deadline.
    #[error("tool timeout")]
    ToolTimeout,

    /// Operation aborted by cancellation.
    #[error("cancelled")]
    Cancelled,

    /// A bounded channel or queue rejected the item.
    #[error("channel closed or full: {0}")]
    Channel(&'static str),

    /// Invalid turn state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// Startup configuration rejected. Fatal.
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn rate_limit(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RateLimit {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Attach a reason code; no-op when one is already attached.
    pub fn with_reason(self, reason: ReasonCode) -> Self {
        if matches!(self, Error::Reasoned { .. }) {
            return self;
        }
        Error::Reasoned {
            reason,
            source: Box::new(self),
        }
    }

    /// Extract the reason code, `Unknown` when none is attached.
    pub fn reason(&self) -> ReasonCode {
        match self {
            Error::Reasoned { reason, .. } => *reason,
            _ => ReasonCode::Unknown,
        }
    }

    /// True when this error is a rate limit, however deeply wrapped.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Error::RateLimit { .. } => true,
            Error::Reasoned { source, .. } => source.is_rate_limit(),
            _ => false,
        }
    }
}
