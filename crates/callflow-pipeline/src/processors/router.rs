//! Agent routing, language detection and call-global fact extraction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use callflow_config::{RouterConfig, RouterMode};
use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Meta, Result};

use super::context::TRANSCRIPT_ONLY;
use super::now_pts;

/// Picks the active agent and extracts structured call-global facts from a
/// final user turn.
pub trait RouterStrategy: Send + Sync {
    fn route(&self, text: &str, meta: &Meta) -> Option<String>;
    fn extract_global(&self, text: &str, meta: &Meta) -> Option<Meta>;
}

pub trait LanguageDetector: Send + Sync {
    /// Returns (language, confidence) or None when undecidable.
    fn detect(&self, text: &str, meta: &Meta) -> Option<(String, f64)>;
}

#[derive(Default)]
struct RouterState {
    active: HashMap<String, String>,
    lang_active: HashMap<String, String>,
    turn_count: HashMap<String, u32>,
}

pub struct RouterProcessor {
    strategy: Arc<dyn RouterStrategy>,
    detector: Mutex<Option<Arc<dyn LanguageDetector>>>,
    min_confidence: Mutex<f64>,
    lang_prompts: Mutex<HashMap<String, String>>,
    mode: Mutex<RouterMode>,
    max_turns: Mutex<u32>,
    code_switching: Mutex<bool>,
    state: Mutex<RouterState>,
}

impl RouterProcessor {
    pub fn new(strategy: Arc<dyn RouterStrategy>) -> Self {
        Self {
            strategy,
            detector: Mutex::new(None),
            min_confidence: Mutex::new(0.5),
            lang_prompts: Mutex::new(HashMap::new()),
            mode: Mutex::new(RouterMode::Full),
            max_turns: Mutex::new(2),
            code_switching: Mutex::new(true),
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn set_config(&self, cfg: &RouterConfig, code_switching: bool) {
        *self.mode.lock() = cfg.mode;
        *self.max_turns.lock() = cfg.max_turns.max(1);
        *self.code_switching.lock() = code_switching;
    }

    pub fn set_language_detector(&self, detector: Arc<dyn LanguageDetector>, min_confidence: f64) {
        *self.detector.lock() = Some(detector);
        if min_confidence > 0.0 {
            *self.min_confidence.lock() = min_confidence;
        }
    }

    pub fn set_language_prompts(&self, prompts: HashMap<String, String>) {
        *self.lang_prompts.lock() = prompts;
    }

    fn set_agent(&self, stream_id: &str, agent: &str) {
        if stream_id.is_empty() || agent.is_empty() {
            return;
        }
        self.state
            .lock()
            .active
            .insert(stream_id.to_string(), agent.to_string());
    }

    fn agent_for(&self, stream_id: &str) -> Option<String> {
        self.state.lock().active.get(stream_id).cloned()
    }

    fn has_language(&self, stream_id: &str, meta_map: &Meta) -> bool {
        if meta_map.get(meta::LANGUAGE).is_some_and(|v| !v.is_empty())
            || meta_map
                .get(meta::GLOBAL_LANGUAGE)
                .is_some_and(|v| !v.is_empty())
        {
            return true;
        }
        self.state.lock().lang_active.contains_key(stream_id)
    }

    fn should_route(&self, stream_id: &str) -> bool {
        match *self.mode.lock() {
            RouterMode::Off => false,
            RouterMode::Full => true,
            RouterMode::Bootstrap => {
                let state = self.state.lock();
                state.turn_count.get(stream_id).copied().unwrap_or(0) < *self.max_turns.lock()
            }
        }
    }

    /// True when the detected language is new for the stream.
    fn update_language(&self, stream_id: &str, lang: &str) -> bool {
        if stream_id.is_empty() || lang.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        if state.lang_active.get(stream_id).map(String::as_str) == Some(lang) {
            return false;
        }
        state
            .lang_active
            .insert(stream_id.to_string(), lang.to_string());
        true
    }

    fn reset_stream(&self, stream_id: &str) {
        if stream_id.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.active.remove(stream_id);
        state.lang_active.remove(stream_id);
        state.turn_count.remove(stream_id);
    }
}

fn format_confidence(v: f64) -> String {
    format!("{:.2}", v.clamp(0.0, 1.0))
}

#[async_trait]
impl FrameProcessor for RouterProcessor {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        match &frame {
            Frame::Control { code, .. } if *code == ControlCode::Handoff => {
                let agent = frame.meta_value(meta::HANDOFF_AGENT).to_string();
                if !agent.is_empty() {
                    let stream_id = frame.stream_id().to_string();
                    self.set_agent(&stream_id, &agent);
                    let mut m = Meta::new();
                    m.insert(meta::GLOBAL_AGENT.to_string(), agent.clone());
                    m.insert(
                        meta::SYSTEM_MESSAGE.to_string(),
                        format!("Handoff ke agent {agent}"),
                    );
                    let trace = frame.meta_value(meta::TRACE_ID);
                    if !trace.is_empty() {
                        m.insert(meta::TRACE_ID.to_string(), trace.to_string());
                    }
                    return Ok(vec![
                        Frame::system(&stream_id, now_pts(), "global_update", m),
                        frame,
                    ]);
                }
                Ok(vec![frame])
            }
            Frame::System { name, .. } => {
                if name == "call_end" {
                    self.reset_stream(frame.stream_id());
                }
                Ok(vec![frame])
            }
            Frame::Text { .. } => {
                let mut meta_map = frame.meta();
                let stream_id = frame.stream_id().to_string();
                let transcript_only = frame.meta_value(TRANSCRIPT_ONLY) == "true";
                if frame.meta_value(meta::SOURCE) == "stt" && !transcript_only {
                    let mut out = Vec::new();
                    let is_final = frame.is_final();
                    let text = match &frame {
                        Frame::Text { text, .. } => text.clone(),
                        _ => unreachable!(),
                    };

                    let code_switching = *self.code_switching.lock();
                    if is_final && (code_switching || !self.has_language(&stream_id, &meta_map)) {
                        let detector = self.detector.lock().clone();
                        if let Some(detector) = detector {
                            if let Some((lang, conf)) = detector.detect(&text, &meta_map) {
                                if !lang.is_empty() && conf >= *self.min_confidence.lock() {
                                    meta_map
                                        .insert(meta::LANGUAGE.to_string(), lang.clone());
                                    meta_map.insert(
                                        meta::LANGUAGE_CONFIDENCE.to_string(),
                                        format_confidence(conf),
                                    );
                                    if self.update_language(&stream_id, &lang) {
                                        let mut g = Meta::new();
                                        g.insert(
                                            meta::GLOBAL_LANGUAGE.to_string(),
                                            lang.clone(),
                                        );
                                        let trace = frame.meta_value(meta::TRACE_ID);
                                        if !trace.is_empty() {
                                            g.insert(
                                                meta::TRACE_ID.to_string(),
                                                trace.to_string(),
                                            );
                                        }
                                        out.push(Frame::system(
                                            &stream_id,
                                            now_pts(),
                                            "global_update",
                                            g,
                                        ));
                                        let prompt =
                                            self.lang_prompts.lock().get(&lang).cloned();
                                        if let Some(prompt) = prompt {
                                            let mut p = Meta::new();
                                            p.insert(
                                                meta::SYSTEM_MESSAGE.to_string(),
                                                prompt,
                                            );
                                            out.push(Frame::system(
                                                &stream_id,
                                                now_pts(),
                                                "language_prompt",
                                                p,
                                            ));
                                        }
                                    }
                                }
                            }
                        }
                    }

                    if is_final && self.should_route(&stream_id) {
                        if let Some(agent) = self.strategy.route(&text, &meta_map) {
                            self.set_agent(&stream_id, &agent);
                        }
                        if let Some(globals) = self.strategy.extract_global(&text, &meta_map) {
                            out.push(Frame::system(
                                &stream_id,
                                now_pts(),
                                "global_update",
                                globals,
                            ));
                        }
                        if !stream_id.is_empty() {
                            *self
                                .state
                                .lock()
                                .turn_count
                                .entry(stream_id.clone())
                                .or_insert(0) += 1;
                        }
                    }

                    if let Some(agent) = self.agent_for(&stream_id) {
                        meta_map.insert(meta::AGENT.to_string(), agent);
                    }
                    out.push(Frame::text(&stream_id, frame.pts(), text, meta_map));
                    return Ok(out);
                }

                // Non-STT (and transcript-only) text: just annotate the agent.
                if let Some(agent) = self.agent_for(&stream_id) {
                    meta_map.insert(meta::AGENT.to_string(), agent);
                    let pts = frame.pts();
                    let text = match frame {
                        Frame::Text { text, .. } => text,
                        _ => unreachable!(),
                    };
                    return Ok(vec![Frame::text(&stream_id, pts, text, meta_map)]);
                }
                Ok(vec![frame])
            }
            _ => Ok(vec![frame]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedStrategy;

    impl RouterStrategy for FixedStrategy {
        fn route(&self, text: &str, _meta: &Meta) -> Option<String> {
            if text.contains("AC") {
                Some("hvac_teknisi".to_string())
            } else {
                None
            }
        }

        fn extract_global(&self, text: &str, _meta: &Meta) -> Option<Meta> {
            if text.contains("AC") {
                let mut g = Meta::new();
                g.insert("global_equipment".to_string(), "ac_split".to_string());
                Some(g)
            } else {
                None
            }
        }
    }

    struct FixedDetector(&'static str, f64);

    impl LanguageDetector for FixedDetector {
        fn detect(&self, _text: &str, _meta: &Meta) -> Option<(String, f64)> {
            Some((self.0.to_string(), self.1))
        }
    }

    fn stt_final(text: &str) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::IS_FINAL.to_string(), "true".to_string());
        Frame::text("S1", now_pts(), text, m)
    }

    #[tokio::test]
    async fn routes_agent_and_extracts_globals() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        let out = p.process(stt_final("AC saya mati total.")).await.unwrap();
        let text = out
            .iter()
            .find_map(|f| match f {
                Frame::Text { meta: m, .. } => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(text.get(meta::AGENT).unwrap(), "hvac_teknisi");
        let update = out
            .iter()
            .find(|f| f.system_name() == "global_update")
            .expect("global update");
        assert_eq!(update.meta_value("global_equipment"), "ac_split");
    }

    #[tokio::test]
    async fn language_detection_annotates_and_updates_global() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        p.set_language_detector(Arc::new(FixedDetector("id", 0.9)), 0.5);
        let out = p.process(stt_final("AC rusak.")).await.unwrap();
        let text_meta = out
            .iter()
            .find_map(|f| match f {
                Frame::Text { meta: m, .. } => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(text_meta.get(meta::LANGUAGE).unwrap(), "id");
        assert_eq!(text_meta.get(meta::LANGUAGE_CONFIDENCE).unwrap(), "0.90");
        assert!(out.iter().any(|f| {
            f.system_name() == "global_update" && f.meta_value(meta::GLOBAL_LANGUAGE) == "id"
        }));

        // Same language again: no repeated global update.
        let out = p.process(stt_final("Masih rusak AC-nya.")).await.unwrap();
        assert!(!out
            .iter()
            .any(|f| f.meta_value(meta::GLOBAL_LANGUAGE) == "id"));
    }

    #[tokio::test]
    async fn low_confidence_detection_is_ignored() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        p.set_language_detector(Arc::new(FixedDetector("en", 0.2)), 0.5);
        let out = p.process(stt_final("AC rusak.")).await.unwrap();
        let text_meta = out
            .iter()
            .find_map(|f| match f {
                Frame::Text { meta: m, .. } => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert!(text_meta.get(meta::LANGUAGE).is_none());
    }

    #[tokio::test]
    async fn bootstrap_mode_stops_after_max_turns() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        p.set_config(
            &RouterConfig {
                mode: RouterMode::Bootstrap,
                max_turns: 1,
            },
            true,
        );
        let out = p.process(stt_final("AC pertama.")).await.unwrap();
        assert!(out.iter().any(|f| f.system_name() == "global_update"));
        let out = p.process(stt_final("AC kedua.")).await.unwrap();
        assert!(!out.iter().any(|f| f.system_name() == "global_update"));
    }

    #[tokio::test]
    async fn handoff_updates_active_agent() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        let mut m = Meta::new();
        m.insert(meta::HANDOFF_AGENT.to_string(), "billing".to_string());
        let out = p
            .process(Frame::control("S1", now_pts(), ControlCode::Handoff, m))
            .await
            .unwrap();
        assert!(out.iter().any(|f| {
            f.system_name() == "global_update" && f.meta_value(meta::GLOBAL_AGENT) == "billing"
        }));
        // Subsequent text carries the new agent.
        let out = p.process(stt_final("lanjut tagihan.")).await.unwrap();
        let text_meta = out
            .iter()
            .find_map(|f| match f {
                Frame::Text { meta: m, .. } => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(text_meta.get(meta::AGENT).unwrap(), "billing");
    }

    #[tokio::test]
    async fn off_mode_never_routes() {
        let p = RouterProcessor::new(Arc::new(FixedStrategy));
        p.set_config(
            &RouterConfig {
                mode: RouterMode::Off,
                max_turns: 2,
            },
            true,
        );
        let out = p.process(stt_final("AC mati.")).await.unwrap();
        assert!(!out.iter().any(|f| f.system_name() == "global_update"));
    }
}
