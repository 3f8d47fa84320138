//! Speculative transcript buffer.
//!
//! Accumulates transcripts without forwarding them to the LLM. The buffer
//! is registered as a turn-state listener and flushes on the Listening ->
//! Thinking transition, so the LLM sees exactly one user turn per
//! utterance. Overflow flushes immediately.
//!
//! Two vendor shapes are handled:
//! - cumulative interims (each interim is the transcript so far): the
//!   transition flush carries the last interim, and the final that trails
//!   it is deduplicated;
//! - final-only vendors: the transition flush is empty, and the final that
//!   arrives while the turn is already closed flushes immediately.

use parking_lot::Mutex;

use crate::turn::{StateChange, StateListener, TurnState};

pub struct ContextBufferOptions {
    pub max_buffer_size: usize,
    pub stream_id: String,
}

impl Default for ContextBufferOptions {
    fn default() -> Self {
        Self {
            max_buffer_size: 10_000,
            stream_id: String::new(),
        }
    }
}

type FlushHandler = Box<dyn Fn(String) -> callflow_core::Result<()> + Send + Sync>;

#[derive(Default)]
struct BufferState {
    buffer: String,
    last_interim: String,
    last_flushed: String,
    /// True between the Listening -> Thinking flush and the next return to
    /// Listening; a final landing in this window flushes immediately.
    turn_closed: bool,
    stream_id: String,
}

pub struct ContextBuffer {
    state: Mutex<BufferState>,
    max_buffer_size: usize,
    flush_handler: FlushHandler,
}

impl ContextBuffer {
    pub fn new(options: ContextBufferOptions, flush_handler: FlushHandler) -> Self {
        let max = if options.max_buffer_size == 0 {
            10_000
        } else {
            options.max_buffer_size
        };
        Self {
            state: Mutex::new(BufferState {
                stream_id: options.stream_id,
                ..Default::default()
            }),
            max_buffer_size: max,
            flush_handler,
        }
    }

    /// Latest non-empty stream id wins; safe to call repeatedly.
    pub fn set_stream_id(&self, id: &str) {
        if id.is_empty() {
            return;
        }
        self.state.lock().stream_id = id.to_string();
    }

    pub fn stream_id(&self) -> String {
        self.state.lock().stream_id.clone()
    }

    pub fn add_transcript(&self, text: &str, is_final: bool) {
        let mut state = self.state.lock();
        if !is_final {
            // Interims are held aside; only committed text enters the buffer.
            state.last_interim = text.to_string();
            return;
        }
        if state.turn_closed && state.last_flushed.trim() == text.trim() {
            // The transition flush already delivered this utterance via its
            // cumulative interims.
            return;
        }
        state.buffer.push_str(text);
        state.buffer.push(' ');
        state.last_interim.clear();
        if state.turn_closed {
            self.flush_locked(&mut state);
            return;
        }
        if state.buffer.len() > self.max_buffer_size {
            tracing::warn!(
                stream_id = %state.stream_id,
                buffer_size = state.buffer.len(),
                max_size = self.max_buffer_size,
                "context_buffer_overflow"
            );
            self.flush_locked(&mut state);
        }
    }

    pub fn flush(&self) {
        let mut state = self.state.lock();
        self.flush_locked(&mut state);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.last_interim.clear();
        state.last_flushed.clear();
        state.turn_closed = false;
    }

    fn flush_locked(&self, state: &mut BufferState) {
        let mut content = state.buffer.trim_end().to_string();
        if content.is_empty() && !state.last_interim.is_empty() {
            content = std::mem::take(&mut state.last_interim);
        }
        if content.is_empty() {
            return;
        }
        if let Err(err) = (self.flush_handler)(content.clone()) {
            tracing::error!(
                stream_id = %state.stream_id,
                error = %err,
                "context_buffer_flush_failed"
            );
            // Content stays buffered for the next flush.
            return;
        }
        state.buffer.clear();
        state.last_flushed = content;
    }
}

impl StateListener for ContextBuffer {
    fn on_state_change(&self, event: &StateChange) {
        if event.from == TurnState::Listening && event.to == TurnState::Thinking {
            let mut state = self.state.lock();
            self.flush_locked(&mut state);
            state.turn_closed = true;
        } else if event.to == TurnState::Listening {
            self.state.lock().turn_closed = false;
        }
    }
}
