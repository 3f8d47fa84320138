//! Reserved frame metadata keys.
//!
//! Meta maps are `string -> string` to keep the wire-adjacent surface
//! language neutral. Keys not listed here are free-form and propagated
//! unchanged by every processor.

/// Unique per media session. Every frame outside `call_start`/`call_end`
/// carries the stream id of its call.
pub const STREAM_ID: &str = "stream_id";
/// Unique per call; may span reconnects (multiple stream ids).
pub const CALL_SID: &str = "call_sid";
/// Observability correlation id.
pub const TRACE_ID: &str = "trace_id";
/// Active agent name for LLM routing.
pub const AGENT: &str = "agent";
/// Target agent carried by a Handoff control frame.
pub const HANDOFF_AGENT: &str = "handoff_agent";
/// Producer tag: `stt`, `llm`, `tts`, `transport`, `turn`, `system`, `dtmf`.
pub const SOURCE: &str = "source";

pub const LANGUAGE: &str = "language";
pub const LANGUAGE_CONFIDENCE: &str = "language_confidence";

/// Prefix for call-global facts aggregated into the shared-context frame.
pub const GLOBAL_PREFIX: &str = "global_";
pub const GLOBAL_LANGUAGE: &str = "global_language";
pub const GLOBAL_AGENT: &str = "global_agent";

/// "true"/"false" on STT transcripts.
pub const IS_FINAL: &str = "is_final";
/// Free-form reason tag on control frames (`barge_in`, `speech_started`, ...).
pub const REASON: &str = "reason";

pub const DTMF_DIGIT: &str = "dtmf_digit";
pub const DTMF_PRIORITY: &str = "dtmf_priority";

pub const TOOL_CALL_ID: &str = "tool_call_id";
pub const TOOL_NAME: &str = "tool_name";
pub const TOOL_ARGS: &str = "tool_args";
pub const TOOL_RESULT: &str = "tool_result";
pub const TOOL_STATUS: &str = "tool_status";
pub const TOOL_ERROR: &str = "tool_error";
pub const TOOL_REQUIRES_CONFIRM: &str = "tool_requires_confirm";
pub const TOOL_CONFIRM_PROMPT: &str = "tool_confirm_prompt";
/// Idempotency key injected into tool arguments when absent.
pub const IDEMPOTENCY_KEY: &str = "idempotency_key";

/// "true" on the last text chunk of an LLM reply; tells TTS to flush.
pub const TTS_FLUSH: &str = "tts_flush";
/// Text the greeting path should speak (reprompts, confirmations).
pub const GREETING_TEXT: &str = "greeting_text";
/// System-message payload injected into LLM history.
pub const SYSTEM_MESSAGE: &str = "system_message";

pub const IMAGE_URL: &str = "image_url";
pub const IMAGE_MIME: &str = "image_mime";
pub const IMAGE_BASE64: &str = "image_base64";
pub const IMAGE_CAPTION: &str = "image_caption";

pub const FROM_NUMBER: &str = "from_number";
pub const SHORT_TURN_ENFORCED: &str = "short_turn_enforced";
pub const RECOVERY_REASON: &str = "recovery_reason";
pub const REPROMPT_ATTEMPT: &str = "reprompt_attempt";
pub const CALL_SUMMARY: &str = "call_summary";
/// Normalized transport end reason: completed|busy|no_answer|failed|unknown.
pub const CALL_END_REASON: &str = "call_end_reason";
pub const ENCODING: &str = "encoding";
