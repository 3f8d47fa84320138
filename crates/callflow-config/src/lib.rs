//! Configuration surface for the callflow runtime.
//!
//! These structs enumerate every tunable the pipeline exposes. Loading
//! (files, environment) is the embedding application's concern; this crate
//! only defines the shapes, serde defaults, and startup validation.
//! Validation failures are fatal: the pipeline never starts with an
//! impossible configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callflow_core::{Error, Result};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub languages: LanguageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub stt_replay: SttReplayConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.turn.validate()?;
        self.tools.validate()?;
        self.router.validate()?;
        self.confirmation.validate()?;
        Ok(())
    }
}

/// Backpressure behavior when a destination channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Release the frame and count a drop.
    #[default]
    Drop,
    /// Block until space frees up or the call is cancelled.
    Wait,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Staged-async mode: one task per processor with bounded channels in
    /// between. Off = one driver task runs the whole chain per frame.
    #[serde(default)]
    pub r#async: bool,
    #[serde(default = "default_stage_buffer")]
    pub stage_buffer: usize,
    #[serde(default = "default_high_capacity")]
    pub high_capacity: usize,
    #[serde(default = "default_low_capacity")]
    pub low_capacity: usize,
    /// High-lane pops served before one low-lane pop is allowed through.
    #[serde(default = "default_fairness_ratio")]
    pub fairness_ratio: u32,
    #[serde(default)]
    pub backpressure: Backpressure,
}

fn default_stage_buffer() -> usize {
    64
}
fn default_high_capacity() -> usize {
    64
}
fn default_low_capacity() -> usize {
    256
}
fn default_fairness_ratio() -> u32 {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            r#async: false,
            stage_buffer: default_stage_buffer(),
            high_capacity: default_high_capacity(),
            low_capacity: default_low_capacity(),
            fairness_ratio: default_fairness_ratio(),
            backpressure: Backpressure::Drop,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.high_capacity == 0 || self.low_capacity == 0 {
            return Err(Error::Config("queue capacities must be positive".into()));
        }
        if self.r#async && self.stage_buffer == 0 {
            return Err(Error::Config(
                "stage_buffer must be positive in async mode".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_barge_in_threshold_ms")]
    pub barge_in_threshold_ms: u64,
    /// User speech shorter than this never interrupts agent speech.
    #[serde(default = "default_min_barge_in_ms")]
    pub min_barge_in_ms: u64,
    /// Safety net for vendors that miss end-of-utterance. 0 disables.
    #[serde(default)]
    pub end_of_turn_timeout_ms: u64,
    #[serde(default)]
    pub silence_reprompt: Option<SilenceRepromptConfig>,
}

fn default_barge_in_threshold_ms() -> u64 {
    500
}
fn default_min_barge_in_ms() -> u64 {
    300
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            barge_in_threshold_ms: default_barge_in_threshold_ms(),
            min_barge_in_ms: default_min_barge_in_ms(),
            end_of_turn_timeout_ms: 0,
            silence_reprompt: None,
        }
    }
}

impl TurnConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(reprompt) = &self.silence_reprompt {
            if reprompt.timeout_ms == 0 {
                return Err(Error::Config(
                    "silence_reprompt.timeout_ms must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceRepromptConfig {
    #[serde(default = "default_silence_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reprompt_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_reprompt_text")]
    pub prompt_text: String,
    #[serde(default)]
    pub prompt_by_language: HashMap<String, String>,
}

fn default_silence_timeout_ms() -> u64 {
    10_000
}
fn default_reprompt_attempts() -> u32 {
    2
}
fn default_reprompt_text() -> String {
    "Halo, apakah Anda masih di line?".to_string()
}

impl Default for SilenceRepromptConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_silence_timeout_ms(),
            max_attempts: default_reprompt_attempts(),
            prompt_text: default_reprompt_text(),
            prompt_by_language: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Non-system messages kept per conversation scope.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Estimated token budget per scope (whitespace tokenizer).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_history() -> usize {
    24
}
fn default_max_tokens() -> usize {
    4096
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tool_retries")]
    pub retries: u32,
    #[serde(default = "default_tool_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Serialize tool execution per stream to keep side effects ordered.
    #[serde(default)]
    pub serialize_by_stream: bool,
}

fn default_tool_concurrency() -> usize {
    4
}
fn default_tool_timeout_ms() -> u64 {
    6_000
}
fn default_tool_retries() -> u32 {
    1
}
fn default_tool_backoff_ms() -> u64 {
    200
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_tool_concurrency(),
            timeout_ms: default_tool_timeout_ms(),
            retries: default_tool_retries(),
            retry_backoff_ms: default_tool_backoff_ms(),
            serialize_by_stream: false,
        }
    }
}

impl ToolsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("tools.concurrency must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_summary_entries")]
    pub max_entries: usize,
    #[serde(default = "default_summary_chars")]
    pub max_chars: usize,
}

fn default_summary_entries() -> usize {
    8
}
fn default_summary_chars() -> usize {
    600
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: default_summary_entries(),
            max_chars: default_summary_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_recovery_prompt")]
    pub prompt_text: String,
    #[serde(default)]
    pub prompt_by_language: HashMap<String, String>,
    /// LLM output containing any of these marks the turn as confused.
    #[serde(default = "default_confusion_phrases")]
    pub phrases: Vec<String>,
}

fn default_recovery_attempts() -> u32 {
    2
}
fn default_recovery_prompt() -> String {
    "Maaf, saya belum menangkapnya. Bisa jelaskan ulang secara singkat?".to_string()
}
fn default_confusion_phrases() -> Vec<String> {
    vec![
        "maaf saya tidak mengerti".to_string(),
        "saya belum paham".to_string(),
        "saya tidak paham".to_string(),
        "could you repeat".to_string(),
        "i didn't understand".to_string(),
    ]
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_recovery_attempts(),
            prompt_text: default_recovery_prompt(),
            prompt_by_language: HashMap::new(),
            phrases: default_confusion_phrases(),
        }
    }
}

/// How tool confirmations are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    /// Keywords first; ambiguous replies fall through to the LLM.
    #[default]
    Hybrid,
    Keywords,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default)]
    pub mode: ConfirmationMode,
    /// In hybrid mode, whether the LLM fallback is actually consulted.
    #[serde(default = "default_true")]
    pub llm_fallback: bool,
    #[serde(default = "default_confirm_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_confirm_timeout_ms() -> u64 {
    600
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            mode: ConfirmationMode::Hybrid,
            llm_fallback: true,
            timeout_ms: default_confirm_timeout_ms(),
        }
    }
}

impl ConfirmationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "confirmation.timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    Off,
    /// Route until `max_turns` final transcripts have been seen.
    Bootstrap,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: RouterMode,
    #[serde(default = "default_router_turns")]
    pub max_turns: u32,
}

fn default_router_turns() -> u32 {
    2
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::Full,
            max_turns: default_router_turns(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == RouterMode::Bootstrap && self.max_turns == 0 {
            return Err(Error::Config(
                "router.max_turns must be positive in bootstrap mode".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    #[serde(default = "default_language")]
    pub default: String,
    /// Keep one vendor session across language switches.
    #[serde(default)]
    pub code_switching: bool,
    /// System prompt injected when the detected language changes.
    #[serde(default)]
    pub prompts: HashMap<String, String>,
    /// Per-language STT provider overrides (language -> provider name).
    #[serde(default)]
    pub stt_overrides: HashMap<String, String>,
    /// Per-language TTS provider overrides (language -> provider name).
    #[serde(default)]
    pub tts_overrides: HashMap<String, String>,
}

fn default_language() -> String {
    "id".to_string()
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            default: default_language(),
            code_switching: false,
            prompts: HashMap::new(),
            stt_overrides: HashMap::new(),
            tts_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub artifacts_dir: String,
    #[serde(default)]
    pub record_audio: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    14
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: String::new(),
            record_audio: false,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub redact_pii: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttReplayConfig {
    /// Recent audio chunks re-sent to a fresh STT session after reconnect.
    #[serde(default = "default_replay_chunks")]
    pub max_chunks: usize,
}

fn default_replay_chunks() -> usize {
    50
}

impl Default for SttReplayConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_replay_chunks(),
        }
    }
}
