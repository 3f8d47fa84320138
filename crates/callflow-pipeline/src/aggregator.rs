//! Sentence aggregation for interim transcript tokens.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use callflow_core::{meta, Frame, FrameKind, Meta};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Shorter fragments are held back unless the frame is final.
    pub min_len: usize,
    pub max_tokens: usize,
    pub max_history: usize,
    /// Idle flush once tokens stop arriving.
    pub flush_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_len: 8,
            max_tokens: 256,
            max_history: 10,
            flush_timeout: Duration::from_millis(300),
        }
    }
}

#[derive(Default)]
struct AggState {
    buffer: String,
    token_count: usize,
    first_pts: i64,
    stream_id: String,
    meta: Option<Meta>,
    last_token_at: Option<Instant>,
    history: Vec<String>,
}

/// Concatenates interim tokens into sentences.
///
/// Flush happens on terminal punctuation (`. ! ? \n`), on an ellipsis once
/// at least 12 chars are buffered, on the token cap, or whenever the frame
/// is final. A bounded rolling history of flushed sentences is retained.
pub struct TextAggregator {
    cfg: AggregatorConfig,
    state: Mutex<AggState>,
}

impl TextAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(AggState::default()),
        }
    }

    pub fn process(&self, frame: Frame) -> Vec<Frame> {
        if frame.kind() != FrameKind::Text {
            // Non-text traffic can still trigger an idle flush.
            let mut state = self.state.lock();
            let idle = state
                .last_token_at
                .map(|t| t.elapsed() > self.cfg.flush_timeout)
                .unwrap_or(false);
            let buffered = state.buffer.trim().to_string();
            if idle && state.token_count > 0 && buffered.len() >= self.cfg.min_len {
                let out = self.take_locked(&mut state, buffered);
                return vec![out, frame];
            }
            return vec![frame];
        }

        let Frame::Text { pts, text, meta } = frame else {
            unreachable!()
        };
        let mut state = self.state.lock();
        if state.first_pts == 0 {
            state.first_pts = pts;
            state.stream_id = meta
                .get(meta::STREAM_ID)
                .cloned()
                .unwrap_or_default();
            state.meta = Some(meta.clone());
        }
        state.buffer.push_str(&text);
        state.token_count += 1;
        state.last_token_at = Some(Instant::now());

        let is_final = matches!(
            meta.get(meta::IS_FINAL)
                .map(|v| v.to_ascii_lowercase())
                .as_deref(),
            Some("true") | Some("1") | Some("yes")
        );
        let complete = eos_detected(&state.buffer)
            || state.token_count >= self.cfg.max_tokens
            || is_final;
        let trimmed = state.buffer.trim().to_string();
        let long_enough = trimmed.len() >= self.cfg.min_len || is_final;
        if complete && long_enough && !trimmed.is_empty() {
            let out = self.take_locked(&mut state, trimmed);
            return vec![out];
        }
        Vec::new()
    }

    /// Flush whatever is buffered, ignoring completion rules.
    pub fn flush_frame(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        let trimmed = state.buffer.trim().to_string();
        if trimmed.is_empty() {
            return None;
        }
        Some(self.take_locked(&mut state, trimmed))
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    fn take_locked(&self, state: &mut AggState, text: String) -> Frame {
        let out = Frame::text(
            &state.stream_id.clone(),
            state.first_pts,
            text.clone(),
            state.meta.take().unwrap_or_default(),
        );
        state.buffer.clear();
        state.token_count = 0;
        state.first_pts = 0;
        state.stream_id.clear();
        if self.cfg.max_history > 0 {
            state.history.push(text);
            let len = state.history.len();
            if len > self.cfg.max_history {
                state.history.drain(..len - self.cfg.max_history);
            }
        }
        out
    }
}

fn eos_detected(s: &str) -> bool {
    let t = s.trim_end();
    if t.is_empty() {
        return false;
    }
    if t.ends_with("...") || t.ends_with('…') {
        return t.len() >= 12;
    }
    matches!(t.chars().last(), Some('.') | Some('!') | Some('?') | Some('\n'))
}
