//! Per-turn latency derivation.
//!
//! Tracks the first audio_in, stt_final, llm_first_token and
//! tts_first_audio per stream and logs the turn's time-to-first-byte once
//! llm_done arrives.

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::event::{Observer, ObserverEvent};

#[derive(Default)]
struct TurnTrace {
    audio_in: Option<SystemTime>,
    stt_final: Option<SystemTime>,
    llm_first: Option<SystemTime>,
    tts_first: Option<SystemTime>,
    llm_done: Option<SystemTime>,
    trace_id: String,
}

#[derive(Default)]
pub struct LatencyObserver {
    traces: Mutex<HashMap<String, TurnTrace>>,
}

impl LatencyObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for LatencyObserver {
    fn record(&self, event: ObserverEvent) {
        let stream_id = event.tag("stream_id");
        if stream_id.is_empty() {
            return;
        }
        let mut traces = self.traces.lock();
        let t = traces.entry(stream_id.to_string()).or_default();
        match event.name.as_str() {
            "stt_audio_in" => {
                t.audio_in.get_or_insert(event.time);
                if t.trace_id.is_empty() {
                    t.trace_id = event.tag("trace_id").to_string();
                }
            }
            "stt_final" => {
                t.stt_final.get_or_insert(event.time);
            }
            "llm_first_token" => {
                t.llm_first.get_or_insert(event.time);
            }
            "tts_first_audio" => {
                t.tts_first.get_or_insert(event.time);
            }
            "llm_done" => {
                t.llm_done = Some(event.time);
            }
            _ => {}
        }
        if t.llm_done.is_some() {
            let t = traces.remove(stream_id).unwrap_or_default();
            tracing::info!(
                stream_id,
                trace_id = %t.trace_id,
                stt_ms = ms_between(t.audio_in, t.stt_final),
                llm_first_token_ms = ms_between(t.stt_final, t.llm_first),
                tts_first_audio_ms = ms_between(t.llm_first, t.tts_first),
                ttfb_ms = ms_between(t.stt_final, t.tts_first),
                "latency"
            );
        }
    }
}

fn ms_between(a: Option<SystemTime>, b: Option<SystemTime>) -> i64 {
    match (a, b) {
        (Some(a), Some(b)) => b
            .duration_since(a)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(-1),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_cleared_after_llm_done() {
        let obs = LatencyObserver::new();
        obs.record(ObserverEvent::new("stt_audio_in").with_tag("stream_id", "s1"));
        obs.record(ObserverEvent::new("stt_final").with_tag("stream_id", "s1"));
        obs.record(ObserverEvent::new("llm_done").with_tag("stream_id", "s1"));
        assert!(obs.traces.lock().is_empty());
    }

    #[test]
    fn events_without_stream_are_ignored() {
        let obs = LatencyObserver::new();
        obs.record(ObserverEvent::new("stt_final"));
        assert!(obs.traces.lock().is_empty());
    }
}
