//! DTMF vs spoken-digit disambiguation.
//!
//! A keypad press usually arrives alongside the vendor transcribing the
//! tone (or the caller reading the digit aloud). Within a short window
//! after a DTMF control, digits-only STT text is dropped or marked so the
//! turn is not duplicated.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Result};

#[derive(Debug, Clone)]
pub struct DtmfDisambiguatorConfig {
    pub window: Duration,
    /// Drop matching spoken digits instead of only marking them.
    pub prefer_dtmf: bool,
    pub mark_only: bool,
}

impl Default for DtmfDisambiguatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            prefer_dtmf: true,
            mark_only: false,
        }
    }
}

fn digits_only() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+$").unwrap())
}

pub struct DtmfDisambiguator {
    cfg: DtmfDisambiguatorConfig,
    last_dtmf: Mutex<HashMap<String, Instant>>,
}

impl DtmfDisambiguator {
    pub fn new(cfg: DtmfDisambiguatorConfig) -> Self {
        Self {
            cfg,
            last_dtmf: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FrameProcessor for DtmfDisambiguator {
    fn name(&self) -> &'static str {
        "dtmf_disambiguator"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        match &frame {
            Frame::System { name, .. } if name == "call_end" => {
                let stream_id = frame.stream_id();
                if !stream_id.is_empty() {
                    self.last_dtmf.lock().remove(stream_id);
                }
                Ok(vec![frame])
            }
            Frame::Control { code, .. } if *code == ControlCode::Dtmf => {
                let stream_id = frame.stream_id();
                if !stream_id.is_empty() {
                    self.last_dtmf
                        .lock()
                        .insert(stream_id.to_string(), Instant::now());
                }
                Ok(vec![frame])
            }
            Frame::Text { text, .. } if frame.meta_value(meta::SOURCE) == "stt" => {
                let trimmed = text.trim();
                let stream_id = frame.stream_id().to_string();
                if trimmed.is_empty() || stream_id.is_empty() || !digits_only().is_match(trimmed)
                {
                    return Ok(vec![frame]);
                }
                let recent = self
                    .last_dtmf
                    .lock()
                    .get(&stream_id)
                    .is_some_and(|at| at.elapsed() <= self.cfg.window);
                if !recent {
                    return Ok(vec![frame]);
                }
                let mut m = frame.meta();
                m.insert(meta::DTMF_PRIORITY.to_string(), "true".to_string());
                if self.cfg.mark_only || !self.cfg.prefer_dtmf {
                    let pts = frame.pts();
                    let text = trimmed.to_string();
                    return Ok(vec![Frame::text(&stream_id, pts, text, m)]);
                }
                // Prefer DTMF: the keypad press already carries the intent.
                Ok(vec![])
            }
            _ => Ok(vec![frame]),
        }
    }
}
