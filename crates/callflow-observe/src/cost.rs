//! Per-trace cost aggregation.
//!
//! Derives STT/TTS audio seconds from `audio_in`/`audio_out` events whose
//! fields carry the payload and format, and accumulates LLM token counts
//! from `llm_done`. Summaries are persisted one JSON file per trace on
//! close.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{Observer, ObserverEvent};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream_id: String,
    pub stt_audio_seconds: f64,
    pub tts_audio_seconds: f64,
    pub llm_tokens: u64,
    #[serde(default)]
    pub recorded_at_utc: String,
}

pub struct CostObserver {
    dir: PathBuf,
    stats: Mutex<HashMap<String, CostSummary>>,
}

impl CostObserver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn summary(&self, id: &str) -> Option<CostSummary> {
        self.stats.lock().get(id).cloned()
    }

    /// Persists every per-trace summary as `<id>.cost.json`.
    pub fn close(&self) -> std::io::Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let mut stats = self.stats.lock();
        for (id, summary) in stats.iter_mut() {
            summary.recorded_at_utc = Utc::now().to_rfc3339();
            let path = self.dir.join(format!("{}.cost.json", sanitize_id(id)));
            let body = serde_json::to_vec_pretty(summary)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(path, body)?;
        }
        Ok(())
    }
}

impl Observer for CostObserver {
    fn record(&self, event: ObserverEvent) {
        let stream_id = event.tag("stream_id").to_string();
        let trace_id = event.tag("trace_id").to_string();
        let id = if trace_id.is_empty() {
            stream_id.clone()
        } else {
            trace_id.clone()
        };
        if id.is_empty() {
            return;
        }

        match event.name.as_str() {
            "audio_in" | "audio_out" => {
                let sec = audio_seconds(&event.fields);
                if sec <= 0.0 {
                    return;
                }
                let mut stats = self.stats.lock();
                let entry = stats.entry(id).or_insert_with(|| CostSummary {
                    trace_id,
                    stream_id,
                    ..Default::default()
                });
                if event.name == "audio_in" {
                    entry.stt_audio_seconds += sec;
                } else {
                    entry.tts_audio_seconds += sec;
                }
            }
            "llm_done" => {
                if let Some(tokens) = event.fields.get("tokens").and_then(|v| v.as_u64()) {
                    let mut stats = self.stats.lock();
                    let entry = stats.entry(id).or_insert_with(|| CostSummary {
                        trace_id,
                        stream_id,
                        ..Default::default()
                    });
                    entry.llm_tokens += tokens;
                }
            }
            _ => {}
        }
    }
}

/// seconds = bytes / (sample_rate * channels), for 8-bit telephony codecs.
fn audio_seconds(fields: &HashMap<String, serde_json::Value>) -> f64 {
    let bytes = match fields.get("payload_b64").and_then(|v| v.as_str()) {
        Some(payload) => match base64::engine::general_purpose::STANDARD.decode(payload) {
            Ok(raw) => raw.len(),
            Err(_) => return 0.0,
        },
        None => fields
            .get("payload_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize,
    };
    let sample_rate = fields
        .get("sample_rate")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let channels = fields.get("channels").and_then(|v| v.as_u64()).unwrap_or(1);
    if bytes == 0 || sample_rate == 0 || channels == 0 {
        return 0.0;
    }
    bytes as f64 / (sample_rate * channels) as f64
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
