//! Short-turn enforcement for telephony replies.

use async_trait::async_trait;

use callflow_core::{meta, Frame, FrameProcessor, Result};

#[derive(Debug, Clone)]
pub struct ResponseLimiterConfig {
    pub max_chars: usize,
    pub max_sentences: usize,
    /// Sources subject to limiting; others pass through untouched.
    pub sources: Vec<String>,
}

impl Default for ResponseLimiterConfig {
    fn default() -> Self {
        Self {
            max_chars: 420,
            max_sentences: 3,
            sources: vec!["llm".to_string(), "system".to_string()],
        }
    }
}

pub struct ResponseLimiter {
    cfg: ResponseLimiterConfig,
}

impl ResponseLimiter {
    pub fn new(cfg: ResponseLimiterConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl FrameProcessor for ResponseLimiter {
    fn name(&self) -> &'static str {
        "response_limiter"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        let Frame::Text { .. } = &frame else {
            return Ok(vec![frame]);
        };
        let source = frame.meta_value(meta::SOURCE);
        if !self.cfg.sources.iter().any(|s| s == source) {
            return Ok(vec![frame]);
        }
        let text = match &frame {
            Frame::Text { text, .. } => text.trim().to_string(),
            _ => unreachable!(),
        };
        if text.is_empty() {
            return Ok(vec![frame]);
        }
        let mut truncated = truncate_sentences(&text, self.cfg.max_sentences);
        if truncated.chars().count() > self.cfg.max_chars {
            truncated = truncated.chars().take(self.cfg.max_chars).collect();
            truncated = truncated.trim().to_string();
        }
        if truncated == text {
            return Ok(vec![frame]);
        }
        let mut m = frame.meta();
        m.insert(meta::SHORT_TURN_ENFORCED.to_string(), "true".to_string());
        let stream_id = frame.stream_id().to_string();
        Ok(vec![Frame::text(&stream_id, frame.pts(), truncated, m)])
    }
}

fn truncate_sentences(text: &str, max_sentences: usize) -> String {
    if max_sentences == 0 {
        return text.to_string();
    }
    let mut out = String::new();
    let mut count = 0;
    for c in text.chars() {
        out.push(c);
        if matches!(c, '.' | '!' | '?') {
            count += 1;
            if count >= max_sentences {
                break;
            }
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        text.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_core::Meta;

    fn llm_text(text: &str) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "llm".to_string());
        Frame::text("S1", 1, text, m)
    }

    #[tokio::test]
    async fn truncates_after_max_sentences() {
        let p = ResponseLimiter::new(ResponseLimiterConfig {
            max_sentences: 2,
            ..Default::default()
        });
        let out = p
            .process(llm_text("Satu. Dua. Tiga. Empat."))
            .await
            .unwrap();
        match &out[0] {
            Frame::Text { text, meta: m, .. } => {
                assert_eq!(text, "Satu. Dua.");
                assert_eq!(m.get(meta::SHORT_TURN_ENFORCED).unwrap(), "true");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn caps_characters() {
        let p = ResponseLimiter::new(ResponseLimiterConfig {
            max_chars: 10,
            max_sentences: 10,
            ..Default::default()
        });
        let out = p
            .process(llm_text("kalimat yang sangat panjang sekali tanpa titik"))
            .await
            .unwrap();
        match &out[0] {
            Frame::Text { text, .. } => assert!(text.chars().count() <= 10),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_replies_pass_unchanged() {
        let p = ResponseLimiter::new(ResponseLimiterConfig::default());
        let out = p.process(llm_text("Baik.")).await.unwrap();
        assert_eq!(out[0].meta_value(meta::SHORT_TURN_ENFORCED), "");
    }

    #[tokio::test]
    async fn user_text_is_not_limited() {
        let p = ResponseLimiter::new(ResponseLimiterConfig {
            max_sentences: 1,
            ..Default::default()
        });
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        let long = "Satu. Dua. Tiga.";
        let out = p.process(Frame::text("S1", 1, long, m)).await.unwrap();
        match &out[0] {
            Frame::Text { text, .. } => assert_eq!(text, long),
            other => panic!("unexpected {other:?}"),
        }
    }
}
