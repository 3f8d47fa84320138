//! Call summaries.
//!
//! Keeps a bounded rolling window of user/agent turns per stream and, on
//! `call_end`, emits a `call_summary` system frame with a localized
//! one-line recap.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use callflow_config::SummaryConfig;
use callflow_core::{meta, Frame, FrameProcessor, Meta, Result};
use callflow_observe::{Observer, ObserverEvent};

use super::context::TRANSCRIPT_ONLY;
use super::now_pts;

struct Entry {
    role: &'static str,
    text: String,
}

#[derive(Default)]
struct SummaryState {
    entries: HashMap<String, Vec<Entry>>,
    last_lang: HashMap<String, String>,
    last_trace: HashMap<String, String>,
    last_call: HashMap<String, String>,
}

pub struct SummaryProcessor {
    cfg: SummaryConfig,
    state: Mutex<SummaryState>,
    observer: Mutex<Option<std::sync::Arc<dyn Observer>>>,
}

impl SummaryProcessor {
    pub fn new(cfg: SummaryConfig) -> Self {
        let mut cfg = cfg;
        if cfg.max_entries == 0 {
            cfg.max_entries = 8;
        }
        if cfg.max_chars == 0 {
            cfg.max_chars = 600;
        }
        Self {
            cfg,
            state: Mutex::new(SummaryState::default()),
            observer: Mutex::new(None),
        }
    }

    pub fn set_observer(&self, observer: std::sync::Arc<dyn Observer>) {
        *self.observer.lock() = Some(observer);
    }

    fn append(&self, stream_id: &str, role: &'static str, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let entries = state.entries.entry(stream_id.to_string()).or_default();
        entries.push(Entry {
            role,
            text: text.to_string(),
        });
        let len = entries.len();
        if len > self.cfg.max_entries {
            entries.drain(..len - self.cfg.max_entries);
        }
    }

    fn build_summary(&self, stream_id: &str) -> String {
        let state = self.state.lock();
        let lang = state
            .last_lang
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        let Some(entries) = state.entries.get(stream_id).filter(|e| !e.is_empty()) else {
            return default_summary(&lang);
        };
        let last_user = entries
            .iter()
            .rev()
            .find(|e| e.role == "user")
            .map(|e| e.text.as_str());
        let last_agent = entries
            .iter()
            .rev()
            .find(|e| e.role == "agent")
            .map(|e| e.text.as_str());
        let mut summary = compose_summary(&lang, last_user, last_agent);
        if summary.chars().count() > self.cfg.max_chars {
            summary = summary.chars().take(self.cfg.max_chars).collect();
        }
        summary
    }

    fn clear(&self, stream_id: &str) {
        let mut state = self.state.lock();
        state.entries.remove(stream_id);
        state.last_lang.remove(stream_id);
        state.last_trace.remove(stream_id);
        state.last_call.remove(stream_id);
    }
}

#[async_trait]
impl FrameProcessor for SummaryProcessor {
    fn name(&self) -> &'static str {
        "summary_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        let stream_id = frame.stream_id().to_string();
        if stream_id.is_empty() {
            return Ok(vec![frame]);
        }
        {
            let mut state = self.state.lock();
            let trace = frame.meta_value(meta::TRACE_ID);
            if !trace.is_empty() {
                state.last_trace.insert(stream_id.clone(), trace.to_string());
            }
            let call = frame.meta_value(meta::CALL_SID);
            if !call.is_empty() {
                state.last_call.insert(stream_id.clone(), call.to_string());
            }
            let lang = frame.meta_value(meta::LANGUAGE);
            if !lang.is_empty() {
                state
                    .last_lang
                    .insert(stream_id.clone(), lang.trim().to_ascii_lowercase());
            }
        }

        match &frame {
            Frame::Text { text, .. } => {
                let source = frame.meta_value(meta::SOURCE);
                if source == "stt" && !frame.is_final() {
                    return Ok(vec![frame]);
                }
                // The speculative flush frame is the canonical user turn;
                // raw forwarded finals would double-count it.
                if frame.meta_value(TRANSCRIPT_ONLY) == "true" {
                    return Ok(vec![frame]);
                }
                let role = if source == "llm" { "agent" } else { "user" };
                self.append(&stream_id, role, text);
                Ok(vec![frame])
            }
            Frame::System { name, .. } if name == "call_end" => {
                let summary = self.build_summary(&stream_id);
                let mut m = Meta::new();
                m.insert(meta::CALL_SUMMARY.to_string(), summary.clone());
                {
                    let state = self.state.lock();
                    if let Some(trace) = state.last_trace.get(&stream_id) {
                        m.insert(meta::TRACE_ID.to_string(), trace.clone());
                    }
                    if let Some(call) = state.last_call.get(&stream_id) {
                        m.insert(meta::CALL_SID.to_string(), call.clone());
                    }
                    if let Some(lang) = state.last_lang.get(&stream_id) {
                        m.insert(meta::LANGUAGE.to_string(), lang.clone());
                    }
                }
                if let Some(observer) = self.observer.lock().clone() {
                    observer.record(
                        ObserverEvent::new("call_summary")
                            .with_tag(meta::STREAM_ID, &stream_id)
                            .with_tag("component", "summary")
                            .with_field("summary", serde_json::Value::String(summary)),
                    );
                }
                self.clear(&stream_id);
                Ok(vec![
                    Frame::system(&stream_id, now_pts(), "call_summary", m),
                    frame,
                ])
            }
            _ => Ok(vec![frame]),
        }
    }
}

fn is_english(lang: &str) -> bool {
    lang.starts_with("en")
}

fn clip_entry(text: Option<&str>) -> String {
    let text = text.unwrap_or("").trim();
    if text.is_empty() {
        return "-".to_string();
    }
    if text.chars().count() <= 120 {
        return text.to_string();
    }
    let clipped: String = text.chars().take(120).collect();
    format!("{clipped}...")
}

fn compose_summary(lang: &str, last_user: Option<&str>, last_agent: Option<&str>) -> String {
    if is_english(lang) {
        format!(
            "Summary: User said \"{}\". Agent responded \"{}\".",
            clip_entry(last_user),
            clip_entry(last_agent)
        )
    } else {
        format!(
            "Ringkasan: User mengatakan \"{}\". Agent merespons \"{}\".",
            clip_entry(last_user),
            clip_entry(last_agent)
        )
    }
}

fn default_summary(lang: &str) -> String {
    if is_english(lang) {
        "Summary: call ended.".to_string()
    } else {
        "Ringkasan: panggilan selesai.".to_string()
    }
}
