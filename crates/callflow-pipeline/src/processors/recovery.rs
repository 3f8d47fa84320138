//! Confusion recovery.
//!
//! When the agent signals confusion (a phrase-list match on LLM output) or
//! the pipeline degrades (`Fallback` control), inject a localized
//! clarification prompt, bounded per stream.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use callflow_config::RecoveryConfig;
use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Meta, Result};

pub struct RecoveryProcessor {
    cfg: RecoveryConfig,
    counts: Mutex<HashMap<String, u32>>,
}

impl RecoveryProcessor {
    pub fn new(cfg: RecoveryConfig) -> Self {
        Self {
            cfg,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn prompt_for(&self, meta_map: &Meta) -> String {
        if let Some(lang) = meta_map.get(meta::LANGUAGE) {
            let lang = lang.trim().to_ascii_lowercase();
            if let Some(prompt) = self.cfg.prompt_by_language.get(&lang) {
                if !prompt.is_empty() {
                    return prompt.clone();
                }
            }
        }
        self.cfg.prompt_text.clone()
    }

    fn is_confusion(&self, text: &str) -> bool {
        let t = text.trim().to_lowercase();
        self.cfg.phrases.iter().any(|p| t.contains(p.as_str()))
    }

    /// True while the stream still has recovery attempts left.
    fn bump(&self, stream_id: &str) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(stream_id.to_string()).or_insert(0);
        *count += 1;
        *count <= self.cfg.max_attempts
    }

    fn reset(&self, stream_id: &str) {
        self.counts.lock().remove(stream_id);
    }
}

#[async_trait]
impl FrameProcessor for RecoveryProcessor {
    fn name(&self) -> &'static str {
        "recovery_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        let stream_id = frame.stream_id().to_string();
        if stream_id.is_empty() {
            return Ok(vec![frame]);
        }
        match &frame {
            Frame::System { name, .. } if name == "call_end" => {
                self.reset(&stream_id);
                Ok(vec![frame])
            }
            Frame::Control { code, .. } if *code == ControlCode::Fallback => {
                if self.bump(&stream_id) {
                    let mut m = frame.meta();
                    m.insert(meta::SOURCE.to_string(), "system".to_string());
                    m.insert(meta::RECOVERY_REASON.to_string(), "fallback".to_string());
                    let prompt = Frame::text(&stream_id, frame.pts(), self.prompt_for(&m), m);
                    return Ok(vec![prompt, frame]);
                }
                Ok(vec![frame])
            }
            Frame::Text { text, .. } if frame.meta_value(meta::SOURCE) == "llm" => {
                if self.is_confusion(text) {
                    if self.bump(&stream_id) {
                        let mut m = frame.meta();
                        m.insert(meta::SOURCE.to_string(), "system".to_string());
                        m.insert(meta::RECOVERY_REASON.to_string(), "confusion".to_string());
                        let prompt =
                            Frame::text(&stream_id, frame.pts(), self.prompt_for(&m), m);
                        return Ok(vec![prompt]);
                    }
                } else {
                    self.reset(&stream_id);
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

    fn llm_text(text: &str) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "llm".to_string());
        Frame::text("S1", 1, text, m)
    }

    #[tokio::test]
    async fn confusion_is_replaced_with_clarification() {
        let p = RecoveryProcessor::new(RecoveryConfig::default());
        let out = p
            .process(llm_text("Maaf saya tidak mengerti maksud Anda"))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Frame::Text { text, meta: m, .. } => {
                assert!(text.starts_with("Maaf, saya belum menangkapnya"));
                assert_eq!(m.get(meta::RECOVERY_REASON).unwrap(), "confusion");
                assert_eq!(m.get(meta::SOURCE).unwrap(), "system");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fallback_injects_prompt_before_control() {
        let p = RecoveryProcessor::new(RecoveryConfig::default());
        let out = p
            .process(Frame::control("S1", 1, ControlCode::Fallback, Meta::new()))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Frame::Text { .. }));
        assert_eq!(out[1].control_code(), Some(ControlCode::Fallback));
    }

    #[tokio::test]
    async fn attempts_are_bounded_and_reset_on_good_output() {
        let p = RecoveryProcessor::new(RecoveryConfig {
            max_attempts: 1,
            ..Default::default()
        });
        let out = p.process(llm_text("saya belum paham")).await.unwrap();
        assert_eq!(out.len(), 1); // replaced
        let out = p.process(llm_text("saya belum paham")).await.unwrap();
        // Budget exhausted: the confused output passes through.
        assert_eq!(out[0].meta_value(meta::RECOVERY_REASON), "");

        // A healthy reply resets the counter.
        p.process(llm_text("Baik, AC Anda akan diperbaiki besok."))
            .await
            .unwrap();
        let out = p.process(llm_text("saya belum paham")).await.unwrap();
        assert_eq!(out[0].meta_value(meta::RECOVERY_REASON), "confusion");
    }

    #[tokio::test]
    async fn localized_prompt_is_used() {
        let mut cfg = RecoveryConfig::default();
        cfg.prompt_by_language
            .insert("en".to_string(), "Could you rephrase that?".to_string());
        let p = RecoveryProcessor::new(cfg);
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "llm".to_string());
        m.insert(meta::LANGUAGE.to_string(), "en".to_string());
        let out = p
            .process(Frame::text("S1", 1, "i didn't understand that", m))
            .await
            .unwrap();
        match &out[0] {
            Frame::Text { text, .. } => assert_eq!(text, "Could you rephrase that?"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
