//! The LLM processor.
//!
//! Owns per-scope message history (scope = `call:<call_sid>` when present,
//! else `stream:<stream_id>`), injects agent system prompts, prunes history
//! by count and estimated tokens, streams replies in sentence-sized chunks,
//! and runs the tool flow: confirmation, dispatch via ToolCall control
//! frames, and follow-up generation when the tool result re-enters the
//! pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_config::{ConfirmationConfig, ConfirmationMode};
use callflow_core::{
    meta, redact, ChatMessage, ContentPart, ControlCode, Frame, FrameProcessor, LlmAdapter,
    LlmContext, Meta, ReasonCode, Result, Role, ToolCall, ToolSpec,
};
use callflow_observe::{Observer, ObserverEvent};

use super::context::TRANSCRIPT_ONLY;
use super::now_pts;

/// Replies shorter than this keep buffering before a chunk is emitted.
const MIN_CHUNK_LEN: usize = 120;
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// One configured agent: a name, its system prompt, and an optional
/// dedicated adapter.
#[derive(Clone)]
pub struct AgentProfile {
    pub name: String,
    pub system: String,
    pub adapter: Option<Arc<dyn LlmAdapter>>,
}

struct PendingConfirm {
    call: ToolCall,
    meta: Meta,
    prompt: String,
}

struct LlmState {
    base_system: String,
    tools: Vec<ToolSpec>,
    tool_index: HashMap<String, ToolSpec>,
    messages_by_scope: HashMap<String, Vec<ChatMessage>>,
    agents: HashMap<String, AgentProfile>,
    default_agent: String,
    active_agent: HashMap<String, String>,
    last_injected: HashMap<String, String>,
    pending_tools: HashMap<String, ToolCall>,
    pending_confirms: HashMap<String, PendingConfirm>,
    last_language: HashMap<String, String>,
    last_language_by_call: HashMap<String, String>,
    last_call_sid: HashMap<String, String>,
    max_history: usize,
    max_tokens: usize,
    confirm_mode: ConfirmationMode,
    confirm_llm_fallback: bool,
    confirm_timeout: Duration,
}

pub struct LlmProcessor {
    adapter: Arc<dyn LlmAdapter>,
    cancel: Mutex<CancellationToken>,
    observer: Mutex<Option<Arc<dyn Observer>>>,
    state: Mutex<LlmState>,
}

impl LlmProcessor {
    pub fn new(
        adapter: Arc<dyn LlmAdapter>,
        base_system: impl Into<String>,
        tools: Vec<ToolSpec>,
    ) -> Self {
        let tool_index = index_tools(&tools);
        Self {
            adapter,
            cancel: Mutex::new(CancellationToken::new()),
            observer: Mutex::new(None),
            state: Mutex::new(LlmState {
                base_system: base_system.into(),
                tools,
                tool_index,
                messages_by_scope: HashMap::new(),
                agents: HashMap::new(),
                default_agent: String::new(),
                active_agent: HashMap::new(),
                last_injected: HashMap::new(),
                pending_tools: HashMap::new(),
                pending_confirms: HashMap::new(),
                last_language: HashMap::new(),
                last_language_by_call: HashMap::new(),
                last_call_sid: HashMap::new(),
                max_history: 0,
                max_tokens: 0,
                confirm_mode: ConfirmationMode::Hybrid,
                confirm_llm_fallback: true,
                confirm_timeout: Duration::from_millis(600),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn set_cancel(&self, cancel: CancellationToken) {
        *self.cancel.lock() = cancel;
    }

    pub fn set_agents(&self, agents: HashMap<String, AgentProfile>, default_agent: &str) {
        let mut state = self.state.lock();
        state.agents = agents;
        state.default_agent = default_agent.to_string();
    }

    pub fn set_tools(&self, tools: Vec<ToolSpec>) {
        let mut state = self.state.lock();
        state.tool_index = index_tools(&tools);
        state.tools = tools;
    }

    pub fn set_memory_limits(&self, max_history: usize, max_tokens: usize) {
        let mut state = self.state.lock();
        state.max_history = max_history;
        state.max_tokens = max_tokens;
    }

    pub fn set_confirmation(&self, cfg: &ConfirmationConfig) {
        let mut state = self.state.lock();
        state.confirm_mode = cfg.mode;
        state.confirm_llm_fallback = cfg.llm_fallback;
        state.confirm_timeout = Duration::from_millis(cfg.timeout_ms.max(1));
    }

    /// Current history snapshot for a scope, mainly for tests/diagnostics.
    pub fn history(&self, scope: &str) -> Vec<ChatMessage> {
        self.state
            .lock()
            .messages_by_scope
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    fn scope_key(meta_map: &Meta) -> String {
        if let Some(call) = meta_map.get(meta::CALL_SID) {
            let call = call.trim();
            if !call.is_empty() {
                return format!("call:{call}");
            }
        }
        if let Some(stream) = meta_map.get(meta::STREAM_ID) {
            let stream = stream.trim();
            if !stream.is_empty() {
                return format!("stream:{stream}");
            }
        }
        "default".to_string()
    }

    fn set_language_from_meta(&self, meta_map: &Meta) {
        let Some(stream_id) = meta_map.get(meta::STREAM_ID).filter(|s| !s.is_empty()) else {
            return;
        };
        let lang = meta_map
            .get(meta::LANGUAGE)
            .or_else(|| meta_map.get(meta::GLOBAL_LANGUAGE))
            .filter(|l| !l.is_empty());
        let Some(lang) = lang else {
            return;
        };
        let mut state = self.state.lock();
        state
            .last_language
            .insert(stream_id.clone(), lang.clone());
        if let Some(call) = meta_map.get(meta::CALL_SID).filter(|c| !c.is_empty()) {
            state
                .last_language_by_call
                .insert(call.clone(), lang.clone());
        }
        if let Some(call) = meta_map.get(meta::CALL_SID).filter(|c| !c.is_empty()) {
            state.last_call_sid.insert(stream_id.clone(), call.clone());
        }
    }

    fn apply_language_meta(&self, meta_map: &mut Meta, stream_id: &str) {
        if stream_id.is_empty() || meta_map.get(meta::LANGUAGE).is_some_and(|l| !l.is_empty()) {
            return;
        }
        let state = self.state.lock();
        if let Some(lang) = state.last_language.get(stream_id) {
            meta_map.insert(meta::LANGUAGE.to_string(), lang.clone());
            return;
        }
        if let Some(call) = meta_map.get(meta::CALL_SID) {
            if let Some(lang) = state.last_language_by_call.get(call) {
                meta_map.insert(meta::LANGUAGE.to_string(), lang.clone());
            }
        }
    }

    fn resolve_agent(&self, meta_map: &Meta, stream_id: &str) -> String {
        let mut state = self.state.lock();
        let mut agent = meta_map
            .get(meta::AGENT)
            .cloned()
            .unwrap_or_default();
        if agent.is_empty() {
            agent = state
                .active_agent
                .get(stream_id)
                .cloned()
                .unwrap_or_default();
        }
        if agent.is_empty() {
            agent = state.default_agent.clone();
        }
        if !agent.is_empty() && !stream_id.is_empty() {
            state
                .active_agent
                .insert(stream_id.to_string(), agent.clone());
        }
        agent
    }

    fn adapter_for(&self, agent: &str) -> Arc<dyn LlmAdapter> {
        let state = self.state.lock();
        state
            .agents
            .get(agent)
            .and_then(|a| a.adapter.clone())
            .unwrap_or_else(|| self.adapter.clone())
    }

    fn ensure_messages<'a>(state: &'a mut LlmState, scope: &str) -> &'a mut Vec<ChatMessage> {
        if !state.messages_by_scope.contains_key(scope) {
            let mut msgs = Vec::new();
            if !state.base_system.is_empty() {
                msgs.push(ChatMessage::system(state.base_system.clone()));
            }
            state.messages_by_scope.insert(scope.to_string(), msgs);
        }
        state.messages_by_scope.get_mut(scope).unwrap()
    }

    fn ensure_agent_injected(state: &mut LlmState, agent: &str, scope: &str) {
        if agent.is_empty() {
            return;
        }
        if state.last_injected.get(scope).map(String::as_str) == Some(agent) {
            return;
        }
        let system = match state.agents.get(agent) {
            Some(profile) if !profile.system.is_empty() => profile.system.clone(),
            _ => return,
        };
        Self::ensure_messages(state, scope).push(ChatMessage::system(system));
        state
            .last_injected
            .insert(scope.to_string(), agent.to_string());
    }

    fn prune(state: &LlmState, messages: &mut Vec<ChatMessage>) {
        if state.max_history > 0 {
            let non_system: Vec<usize> = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| m.role != Role::System)
                .map(|(i, _)| i)
                .collect();
            if non_system.len() > state.max_history {
                let to_drop: std::collections::HashSet<usize> = non_system
                    [..non_system.len() - state.max_history]
                    .iter()
                    .copied()
                    .collect();
                let mut idx = 0;
                messages.retain(|_| {
                    let keep = !to_drop.contains(&idx);
                    idx += 1;
                    keep
                });
            }
        }
        if state.max_tokens > 0 {
            while estimate_tokens(messages) > state.max_tokens {
                let Some(pos) = messages.iter().position(|m| m.role != Role::System) else {
                    break;
                };
                messages.remove(pos);
            }
        }
    }

    fn append_message(&self, scope: &str, message: ChatMessage) {
        let mut state = self.state.lock();
        let messages = Self::ensure_messages(&mut state, scope);
        messages.push(message);
        let mut taken = std::mem::take(state.messages_by_scope.get_mut(scope).unwrap());
        Self::prune(&state, &mut taken);
        state.messages_by_scope.insert(scope.to_string(), taken);
    }

    fn append_system_text(&self, scope: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.append_message(scope, ChatMessage::system(text));
    }

    fn append_assistant_text(&self, scope: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.append_message(scope, ChatMessage::assistant(text));
    }

    /// Build the request context after appending the user turn.
    fn context_with_user(
        &self,
        text: &str,
        meta_map: &Meta,
        agent: &str,
        scope: &str,
    ) -> LlmContext {
        let image_url = meta_map.get(meta::IMAGE_URL).cloned().unwrap_or_default();
        let image_b64 = meta_map
            .get(meta::IMAGE_BASE64)
            .cloned()
            .unwrap_or_default();
        let user = if image_url.is_empty() && image_b64.is_empty() {
            ChatMessage::user(text)
        } else {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(ContentPart::Text {
                    text: text.to_string(),
                });
            }
            if !image_url.is_empty() {
                parts.push(ContentPart::ImageUrl { url: image_url });
            } else {
                let mime = meta_map
                    .get(meta::IMAGE_MIME)
                    .filter(|m| !m.is_empty())
                    .cloned()
                    .unwrap_or_else(|| "image/png".to_string());
                parts.push(ContentPart::ImageUrl {
                    url: format!("data:{mime};base64,{image_b64}"),
                });
            }
            ChatMessage::user_parts(parts)
        };

        let mut state = self.state.lock();
        Self::ensure_agent_injected(&mut state, agent, scope);
        let messages = Self::ensure_messages(&mut state, scope);
        messages.push(user);
        let mut taken = std::mem::take(state.messages_by_scope.get_mut(scope).unwrap());
        Self::prune(&state, &mut taken);
        state.messages_by_scope.insert(scope.to_string(), taken);
        LlmContext {
            messages: state.messages_by_scope.get(scope).cloned().unwrap_or_default(),
            tools: state.tools.clone(),
        }
    }

    fn context_snapshot(&self, scope: &str) -> LlmContext {
        let mut state = self.state.lock();
        Self::ensure_messages(&mut state, scope);
        LlmContext {
            messages: state.messages_by_scope.get(scope).cloned().unwrap_or_default(),
            tools: state.tools.clone(),
        }
    }

    fn pop_last_message(&self, scope: &str) {
        let mut state = self.state.lock();
        if let Some(messages) = state.messages_by_scope.get_mut(scope) {
            messages.pop();
        }
    }

    fn clear_call(&self, meta_map: &Meta) {
        let stream_id = meta_map
            .get(meta::STREAM_ID)
            .cloned()
            .unwrap_or_default();
        let call_sid = meta_map.get(meta::CALL_SID).cloned().unwrap_or_default();
        let mut state = self.state.lock();
        state.active_agent.remove(&stream_id);
        state.last_language.remove(&stream_id);
        state.pending_confirms.remove(&stream_id);
        state.last_call_sid.remove(&stream_id);
        if !stream_id.is_empty() {
            state.messages_by_scope.remove(&format!("stream:{stream_id}"));
            state.last_injected.remove(&format!("stream:{stream_id}"));
        }
        if !call_sid.is_empty() {
            state.messages_by_scope.remove(&format!("call:{call_sid}"));
            state.last_injected.remove(&format!("call:{call_sid}"));
            state.last_language_by_call.remove(&call_sid);
        }
    }

    fn language_from(meta_map: &Meta) -> String {
        meta_map
            .get(meta::LANGUAGE)
            .or_else(|| meta_map.get(meta::GLOBAL_LANGUAGE))
            .map(|l| l.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn record(&self, name: &str, stream_id: &str, trace_id: &str) {
        if let Some(observer) = self.observer.lock().clone() {
            observer.record(
                ObserverEvent::new(name)
                    .with_tag(meta::STREAM_ID, stream_id)
                    .with_tag(meta::TRACE_ID, trace_id)
                    .with_tag("component", "llm")
                    .with_tag("provider", self.adapter.name()),
            );
        }
    }

    fn record_with_fields(
        &self,
        name: &str,
        stream_id: &str,
        trace_id: &str,
        fields: Vec<(&str, serde_json::Value)>,
    ) {
        if let Some(observer) = self.observer.lock().clone() {
            let mut event = ObserverEvent::new(name)
                .with_tag(meta::STREAM_ID, stream_id)
                .with_tag("component", "llm")
                .with_tag(meta::TRACE_ID, trace_id);
            for (k, v) in fields {
                event = event.with_field(k, v);
            }
            observer.record(event);
        }
    }

    /// Emit ToolCall controls framed by thinking markers.
    fn emit_tool_calls(&self, stream_id: &str, calls: Vec<ToolCall>, meta_map: &Meta) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut state = self.state.lock();
        for call in calls {
            state.pending_tools.insert(call.id.clone(), call.clone());
            let mut m = Meta::new();
            m.insert(meta::TOOL_CALL_ID.to_string(), call.id.clone());
            m.insert(meta::TOOL_NAME.to_string(), call.name.clone());
            m.insert(
                meta::TOOL_ARGS.to_string(),
                serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string()),
            );
            if let Some(tool) = state.tool_index.get(&call.name) {
                if tool.requires_confirmation {
                    m.insert(meta::TOOL_REQUIRES_CONFIRM.to_string(), "true".to_string());
                    let prompt = confirm_prompt_for(tool, &Self::language_from(meta_map));
                    if !prompt.is_empty() {
                        m.insert(meta::TOOL_CONFIRM_PROMPT.to_string(), prompt);
                    }
                }
            }
            for key in [meta::CALL_SID, meta::TRACE_ID, meta::LANGUAGE, meta::AGENT] {
                if let Some(v) = meta_map.get(key) {
                    if !v.is_empty() {
                        m.insert(key.to_string(), v.clone());
                    }
                }
            }
            out.push(Frame::control(stream_id, now_pts(), ControlCode::ToolCall, m));
        }
        out
    }

    fn tool_flow_frames(&self, stream_id: &str, calls: Vec<ToolCall>, meta_map: &Meta) -> Vec<Frame> {
        let mut out = vec![Frame::system(
            stream_id,
            now_pts(),
            "thinking_start",
            meta_map.clone(),
        )];
        out.extend(self.emit_tool_calls(stream_id, calls, meta_map));
        out.push(Frame::system(
            stream_id,
            now_pts(),
            "thinking_end",
            meta_map.clone(),
        ));
        out
    }

    fn greeting_meta(&self, stream_id: &str, pending_meta: &Meta, greeting: String) -> Meta {
        let mut m = Meta::new();
        m.insert(meta::GREETING_TEXT.to_string(), greeting);
        for key in [meta::CALL_SID, meta::TRACE_ID, meta::AGENT] {
            if let Some(v) = pending_meta.get(key) {
                if !v.is_empty() {
                    m.insert(key.to_string(), v.clone());
                }
            }
        }
        self.apply_language_meta(&mut m, stream_id);
        m
    }

    /// Emits a greeting-bearing system frame together with its spoken Text
    /// rewrite. Frames emitted here flow only to later stages, so the
    /// input-side greeting branch never sees them; the rewrite happens at
    /// emission so the prompt still reaches TTS.
    fn greeting_frames(&self, stream_id: &str, name: &str, m: Meta) -> Vec<Frame> {
        let system = Frame::system(stream_id, now_pts(), name, m);
        let meta_map = system.meta();
        let Some(greeting) = meta_map
            .get(meta::GREETING_TEXT)
            .filter(|g| !g.is_empty())
            .cloned()
        else {
            return vec![system];
        };
        let scope = Self::scope_key(&meta_map);
        let mut tm = meta_map;
        tm.insert(meta::SOURCE.to_string(), "llm".to_string());
        self.apply_language_meta(&mut tm, stream_id);
        self.append_assistant_text(&scope, &greeting);
        let pts = system.pts();
        vec![system, Frame::text(stream_id, pts, greeting, tm)]
    }

    /// Handles tool calls returned by the model, interposing a confirmation
    /// prompt when the first call requires it.
    fn handle_tool_calls(&self, stream_id: &str, calls: Vec<ToolCall>, meta_map: &Meta) -> Vec<Frame> {
        let needs_confirm = {
            let state = self.state.lock();
            calls.iter().find_map(|call| {
                state
                    .tool_index
                    .get(&call.name)
                    .filter(|t| t.requires_confirmation)
                    .map(|t| (call.clone(), t.clone()))
            })
        };
        if let Some((call, tool)) = needs_confirm {
            let lang = Self::language_from(meta_map);
            let prompt = confirm_prompt_for(&tool, &lang);
            {
                let mut state = self.state.lock();
                if !stream_id.is_empty() {
                    state.pending_confirms.insert(
                        stream_id.to_string(),
                        PendingConfirm {
                            call,
                            meta: meta_map.clone(),
                            prompt: prompt.clone(),
                        },
                    );
                }
            }
            let m = self.greeting_meta(stream_id, meta_map, prompt);
            return self.greeting_frames(stream_id, "tool_confirm_prompt", m);
        }
        self.tool_flow_frames(stream_id, calls, meta_map)
    }

    /// Resolves a pending confirmation with the user's reply; returns the
    /// frames to emit, or None when no confirmation is pending.
    async fn handle_pending_confirmation(
        &self,
        stream_id: &str,
        text: &str,
    ) -> Option<Vec<Frame>> {
        let (mode, llm_fallback, timeout, pending) = {
            let state = self.state.lock();
            if !state.pending_confirms.contains_key(stream_id) {
                return None;
            }
            let p = state.pending_confirms.get(stream_id).unwrap();
            (
                state.confirm_mode,
                state.confirm_llm_fallback,
                state.confirm_timeout,
                (p.call.clone(), p.meta.clone(), p.prompt.clone()),
            )
        };
        let (call, pending_meta, prompt) = pending;
        let lang = Self::language_from(&pending_meta);

        let use_keywords = matches!(mode, ConfirmationMode::Hybrid | ConfirmationMode::Keywords);
        let llm_enabled = matches!(mode, ConfirmationMode::Llm)
            || (mode == ConfirmationMode::Hybrid && llm_fallback);

        let mut decision = if use_keywords {
            confirmation_intent(text)
        } else {
            ConfirmDecision::Other
        };
        if decision == ConfirmDecision::Other && llm_enabled {
            decision = self.classify_confirmation(text, &lang, timeout).await;
        }

        match decision {
            ConfirmDecision::Yes => {
                self.state.lock().pending_confirms.remove(stream_id);
                let mut m = pending_meta.clone();
                m.insert(meta::STREAM_ID.to_string(), stream_id.to_string());
                self.apply_language_meta(&mut m, stream_id);
                Some(self.tool_flow_frames(stream_id, vec![call], &m))
            }
            ConfirmDecision::No => {
                self.state.lock().pending_confirms.remove(stream_id);
                let m = self.greeting_meta(stream_id, &pending_meta, default_cancel_prompt(&lang));
                Some(self.greeting_frames(stream_id, "tool_confirm_cancelled", m))
            }
            ConfirmDecision::Other => {
                // Ambiguous reply: repeat the original confirmation prompt.
                let repeat = if prompt.is_empty() {
                    default_confirm_prompt(&lang)
                } else {
                    prompt
                };
                let m = self.greeting_meta(stream_id, &pending_meta, repeat);
                Some(self.greeting_frames(stream_id, "tool_confirm_repeat", m))
            }
        }
    }

    async fn classify_confirmation(
        &self,
        text: &str,
        lang: &str,
        timeout: Duration,
    ) -> ConfirmDecision {
        let input = LlmContext {
            messages: vec![
                ChatMessage::system(confirmation_classifier_prompt(lang)),
                ChatMessage::user(text),
            ],
            tools: Vec::new(),
        };
        match tokio::time::timeout(timeout, self.adapter.generate(input)).await {
            Ok(Ok(resp)) => parse_confirmation_decision(&resp.text),
            _ => ConfirmDecision::Other,
        }
    }

    /// Consume a token stream into chunked text frames. The final chunk
    /// carries `tts_flush=true`; the full reply is appended to history.
    async fn stream_to_frames(
        &self,
        src_meta: &Meta,
        stream_id: &str,
        scope: &str,
        mut tokens: callflow_core::TokenStream,
    ) -> Vec<Frame> {
        let trace_id = src_meta
            .get(meta::TRACE_ID)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        let mut full = String::new();
        let mut chunk = String::new();
        let mut first = true;

        let mut emit_chunk = |text: String, flush: bool, out: &mut Vec<Frame>| {
            let mut m = src_meta.clone();
            m.insert(meta::SOURCE.to_string(), "llm".to_string());
            m.remove(TRANSCRIPT_ONLY);
            self.apply_language_meta(&mut m, stream_id);
            if flush {
                m.insert(meta::TTS_FLUSH.to_string(), "true".to_string());
            }
            out.push(Frame::text(stream_id, now_pts(), text, m));
        };

        while let Some(token) = tokens.next().await {
            if first {
                first = false;
                self.record("llm_first_token", stream_id, &trace_id);
            }
            full.push_str(&token);
            chunk.push_str(&token);
            if chunk.len() >= MIN_CHUNK_LEN {
                emit_chunk(std::mem::take(&mut chunk), false, &mut out);
            }
        }
        if chunk.is_empty() {
            emit_chunk(String::new(), true, &mut out);
        } else {
            emit_chunk(std::mem::take(&mut chunk), true, &mut out);
        }
        self.append_assistant_text(scope, &full);
        self.record_with_fields(
            "llm_output_text",
            stream_id,
            &trace_id,
            vec![("text", serde_json::Value::String(redact::text(&full)))],
        );
        self.record("llm_done", stream_id, &trace_id);
        out
    }

    /// Applies a `tool_result` system frame: updates history and streams
    /// the follow-up answer. Unknown tool_call_ids are ignored.
    async fn apply_tool_result(&self, frame: &Frame) -> Option<Vec<Frame>> {
        let meta_map = frame.meta();
        let stream_id = frame.stream_id().to_string();
        let scope = Self::scope_key(&meta_map);
        self.set_language_from_meta(&meta_map);

        let call_id = meta_map
            .get(meta::TOOL_CALL_ID)
            .cloned()
            .unwrap_or_default();
        let result = meta_map
            .get(meta::TOOL_RESULT)
            .cloned()
            .unwrap_or_default();
        let mut status = meta_map
            .get(meta::TOOL_STATUS)
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        if !status.is_empty() && status != "ok" {
            self.append_system_text(&scope, &tool_failure_message(&Self::language_from(&meta_map)));
        }
        if call_id.is_empty() || result.is_empty() {
            return None;
        }

        let call = {
            let mut state = self.state.lock();
            state.pending_tools.remove(&call_id)
        };
        // At most one tool_result per known call id; the rest are noise.
        let call = call?;
        if status.is_empty() {
            status = "ok".to_string();
        }
        self.record_with_fields(
            "tool_result",
            &stream_id,
            meta_map.get(meta::TRACE_ID).map(String::as_str).unwrap_or(""),
            vec![
                ("tool", serde_json::Value::String(call.name.clone())),
                ("status", serde_json::Value::String(status)),
            ],
        );

        self.append_message(&scope, ChatMessage::assistant_tool_calls(vec![call]));
        self.append_message(&scope, ChatMessage::tool(result, call_id));

        let agent = self.resolve_agent(&meta_map, &stream_id);
        let adapter = self.adapter_for(&agent);
        let input = self.context_snapshot(&scope);
        match adapter.stream(input).await {
            Ok(tokens) => Some(self.stream_to_frames(&meta_map, &stream_id, &scope, tokens).await),
            Err(err) => {
                let reason = if err.is_rate_limit() {
                    ReasonCode::LlmRateLimit
                } else {
                    ReasonCode::LlmStream
                };
                let err = err.with_reason(reason);
                tracing::error!(
                    stream_id = %stream_id,
                    reason_code = %err.reason(),
                    error = %err,
                    "llm_stream_error"
                );
                Some(vec![Frame::control(
                    &stream_id,
                    now_pts(),
                    ControlCode::Fallback,
                    meta_map,
                )])
            }
        }
    }
}

#[async_trait]
impl FrameProcessor for LlmProcessor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        if let Frame::System { name, .. } = &frame {
            let meta_map = frame.meta();
            let scope = Self::scope_key(&meta_map);
            if let Some(msg) = meta_map.get(meta::SYSTEM_MESSAGE) {
                self.append_system_text(&scope, msg);
            }
            self.set_language_from_meta(&meta_map);
            if name == "call_end" {
                self.clear_call(&meta_map);
            }
            if name == "tool_result" {
                if let Some(mut out) = self.apply_tool_result(&frame).await {
                    out.push(frame);
                    return Ok(out);
                }
                return Ok(vec![frame]);
            }
            if let Some(greeting) = meta_map.get(meta::GREETING_TEXT).filter(|g| !g.is_empty()) {
                let stream_id = frame.stream_id().to_string();
                let mut m = meta_map.clone();
                m.insert(meta::SOURCE.to_string(), "llm".to_string());
                self.apply_language_meta(&mut m, &stream_id);
                self.append_assistant_text(&scope, greeting);
                return Ok(vec![Frame::text(&stream_id, frame.pts(), greeting.clone(), m)]);
            }
            return Ok(vec![frame]);
        }

        let Frame::Text { .. } = &frame else {
            return Ok(vec![frame]);
        };
        if frame.meta_value(TRANSCRIPT_ONLY) == "true" {
            return Ok(vec![frame]);
        }

        let meta_map = frame.meta();
        let stream_id = frame.stream_id().to_string();
        self.set_language_from_meta(&meta_map);
        if let Some(call) = meta_map.get(meta::CALL_SID).filter(|c| !c.is_empty()) {
            self.state
                .lock()
                .last_call_sid
                .insert(stream_id.clone(), call.clone());
        }
        let scope = Self::scope_key(&meta_map);
        let text = match &frame {
            Frame::Text { text, .. } => text.clone(),
            _ => unreachable!(),
        };

        if let Some(out) = self.handle_pending_confirmation(&stream_id, &text).await {
            return Ok(out);
        }

        tracing::info!(
            stream_id = %stream_id,
            text = %redact::clip(&redact::text(&text)),
            "llm_input_received"
        );

        let agent = self.resolve_agent(&meta_map, &stream_id);
        let input = self.context_with_user(&text, &meta_map, &agent, &scope);
        // Stop any in-flight TTS before the new answer starts.
        let mut out = vec![Frame::control(
            &stream_id,
            now_pts(),
            ControlCode::StartInterruption,
            meta_map.clone(),
        )];
        let adapter = self.adapter_for(&agent);

        tracing::info!(stream_id = %stream_id, agent = %agent, "llm_generating");
        let cancel = self.cancel.lock().clone();
        let generated = tokio::select! {
            _ = cancel.cancelled() => {
                self.pop_last_message(&scope);
                return Ok(out);
            }
            r = tokio::time::timeout(GENERATE_TIMEOUT, adapter.generate(input)) => r,
        };
        let response = match generated {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                let reason = if err.is_rate_limit() {
                    ReasonCode::LlmRateLimit
                } else {
                    ReasonCode::LlmGenerate
                };
                let err = err.with_reason(reason);
                tracing::error!(
                    stream_id = %stream_id,
                    reason_code = %err.reason(),
                    error = %err,
                    "llm_generate_error"
                );
                // Roll back the user turn so history does not wedge.
                self.pop_last_message(&scope);
                out.push(Frame::control(
                    &stream_id,
                    now_pts(),
                    ControlCode::Fallback,
                    meta_map,
                ));
                return Ok(out);
            }
            Err(_) => {
                tracing::error!(stream_id = %stream_id, "llm_generate_timeout");
                self.pop_last_message(&scope);
                out.push(Frame::control(
                    &stream_id,
                    now_pts(),
                    ControlCode::Fallback,
                    meta_map,
                ));
                return Ok(out);
            }
        };

        if let Some(handoff) = response
            .handoff_agent
            .as_ref()
            .filter(|h| !h.is_empty())
        {
            let mut m = Meta::new();
            m.insert(meta::HANDOFF_AGENT.to_string(), handoff.clone());
            m.insert(meta::AGENT.to_string(), agent.clone());
            out.push(Frame::control(
                &stream_id,
                now_pts(),
                ControlCode::Handoff,
                m,
            ));
        }

        if !response.tool_calls.is_empty() {
            out.extend(self.handle_tool_calls(&stream_id, response.tool_calls, &meta_map));
            return Ok(out);
        }

        let input = self.context_snapshot(&scope);
        match adapter.stream(input).await {
            Ok(tokens) => {
                out.extend(
                    self.stream_to_frames(&meta_map, &stream_id, &scope, tokens)
                        .await,
                );
                Ok(out)
            }
            Err(err) => {
                let reason = if err.is_rate_limit() {
                    ReasonCode::LlmRateLimit
                } else {
                    ReasonCode::LlmStream
                };
                let err = err.with_reason(reason);
                tracing::error!(
                    stream_id = %stream_id,
                    reason_code = %err.reason(),
                    error = %err,
                    "llm_stream_error"
                );
                out.push(Frame::control(
                    &stream_id,
                    now_pts(),
                    ControlCode::Fallback,
                    meta_map,
                ));
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfirmDecision {
    Yes,
    No,
    Other,
}

fn index_tools(tools: &[ToolSpec]) -> HashMap<String, ToolSpec> {
    tools
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| (t.name.clone(), t.clone()))
        .collect()
}

fn split_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Whitespace-class token estimator. Swap this out for a provider
/// tokenizer when exact budgets matter.
fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| split_tokens(&m.text_content()).len())
        .sum()
}

const YES_WORDS: &[&str] = &[
    "ya", "iya", "y", "yes", "yep", "yup", "sure", "ok", "oke", "okay", "okey", "lanjut",
    "setuju", "boleh", "confirm", "siap", "sip", "baik", "benar",
];
const NO_WORDS: &[&str] = &[
    "tidak", "gak", "nggak", "ngga", "enggak", "ga", "no", "nope", "cancel", "batal", "jangan",
    "stop", "jgn",
];

fn confirmation_intent(text: &str) -> ConfirmDecision {
    let t = text.trim().to_lowercase();
    if t.is_empty() {
        return ConfirmDecision::Other;
    }
    let t = t.strip_prefix("dtmf input:").unwrap_or(&t).trim().to_string();
    let tokens = split_tokens(&t);
    for token in &tokens {
        match token.as_str() {
            "1" => return ConfirmDecision::Yes,
            "2" => return ConfirmDecision::No,
            _ => {}
        }
    }
    for token in &tokens {
        if YES_WORDS.contains(&token.as_str()) {
            return ConfirmDecision::Yes;
        }
        if NO_WORDS.contains(&token.as_str()) {
            return ConfirmDecision::No;
        }
    }
    ConfirmDecision::Other
}

fn parse_confirmation_decision(text: &str) -> ConfirmDecision {
    for token in split_tokens(&text.to_lowercase()) {
        match token.as_str() {
            "yes" | "ya" | "iya" | "y" | "benar" | "setuju" => return ConfirmDecision::Yes,
            "no" | "tidak" | "gak" | "nggak" | "ga" | "cancel" | "batal" => {
                return ConfirmDecision::No
            }
            _ => {}
        }
    }
    ConfirmDecision::Other
}

fn is_english(lang: &str) -> bool {
    lang.trim().to_ascii_lowercase().starts_with("en")
}

fn confirm_prompt_for(tool: &ToolSpec, lang: &str) -> String {
    if let Some(prompt) = tool.confirmation_prompt_by_language.get(lang) {
        if !prompt.is_empty() {
            return prompt.clone();
        }
    }
    if let Some(prompt) = &tool.confirmation_prompt {
        if !prompt.is_empty() {
            return prompt.clone();
        }
    }
    default_confirm_prompt(lang)
}

fn default_confirm_prompt(lang: &str) -> String {
    if is_english(lang) {
        "Before I proceed, do you want me to continue?".to_string()
    } else {
        "Sebelum saya lanjut, apakah boleh saya teruskan?".to_string()
    }
}

fn default_cancel_prompt(lang: &str) -> String {
    if is_english(lang) {
        "Okay, I won't proceed.".to_string()
    } else {
        "Baik, saya tidak akan melanjutkan.".to_string()
    }
}

fn tool_failure_message(lang: &str) -> String {
    if is_english(lang) {
        "The tool failed or timed out. Summarize briefly and suggest the next step.".to_string()
    } else {
        "Tool gagal atau timeout. Berikan ringkasan singkat dan sarankan langkah berikutnya."
            .to_string()
    }
}

fn confirmation_classifier_prompt(lang: &str) -> String {
    if is_english(lang) {
        "Classify the user's reply to a confirmation request. Reply with only: yes, no, or \
         other. Consider Indonesian/English, short replies, and DTMF (1=yes, 2=no). If unsure, \
         answer other."
            .to_string()
    } else {
        "Klasifikasikan jawaban user terhadap permintaan konfirmasi. Jawab hanya: yes, no, atau \
         other. Pertimbangkan bahasa Indonesia/Inggris, jawaban singkat, dan DTMF (1=yes, \
         2=no). Jika ragu, jawab other."
            .to_string()
    }
}
