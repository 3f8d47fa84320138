//! The four-state turn machine.
//!
//! Allowed transitions:
//!
//! ```text
//! Idle      -> Listening
//! Listening -> Thinking | Idle
//! Thinking  -> Speaking | Listening | Idle
//! Speaking  -> Listening | Idle
//! ```
//!
//! Anything outside the graph is rejected with an error and changes
//! nothing. Listener notification happens outside the state lock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::sync::Arc;

use callflow_core::{meta, ControlCode, Error, Frame, Meta, Result};

use super::manager::FrameEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
        }
    }
}

/// A committed transition, delivered to listeners.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub from: TurnState,
    pub to: TurnState,
    pub at: Instant,
    pub reason: String,
}

pub trait StateListener: Send + Sync {
    fn on_state_change(&self, event: &StateChange);
}

#[derive(Default)]
struct MachineState {
    current: TurnState,
    speaking_since: Option<Instant>,
    listening_since: Option<Instant>,
}

pub struct StateMachine {
    state: Mutex<MachineState>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    barge_in_threshold: Duration,
    emitter: Mutex<Option<Arc<dyn FrameEmitter>>>,
}

fn transition_valid(from: TurnState, to: TurnState) -> bool {
    use TurnState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Thinking)
            | (Listening, Idle)
            | (Thinking, Speaking)
            | (Thinking, Listening)
            | (Thinking, Idle)
            | (Speaking, Listening)
            | (Speaking, Idle)
    )
}

impl StateMachine {
    pub fn new(barge_in_threshold: Duration) -> Self {
        let barge_in_threshold = if barge_in_threshold.is_zero() {
            Duration::from_millis(500)
        } else {
            barge_in_threshold
        };
        Self {
            state: Mutex::new(MachineState::default()),
            listeners: Mutex::new(Vec::new()),
            barge_in_threshold,
            emitter: Mutex::new(None),
        }
    }

    pub fn set_emitter(&self, emitter: Arc<dyn FrameEmitter>) {
        *self.emitter.lock() = Some(emitter);
    }

    pub fn state(&self) -> TurnState {
        self.state.lock().current
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners.lock().push(listener);
    }

    /// Moves to `to`, or errors without side effects when the edge is not
    /// in the graph.
    pub fn transition(&self, to: TurnState, reason: &str) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let from = state.current;
            if !transition_valid(from, to) {
                return Err(Error::InvalidTransition {
                    from: from.as_str(),
                    to: to.as_str(),
                });
            }
            state.current = to;
            let now = Instant::now();
            match to {
                TurnState::Listening => state.listening_since = Some(now),
                TurnState::Speaking => state.speaking_since = Some(now),
                _ => {}
            }
            StateChange {
                from,
                to,
                at: now,
                reason: reason.to_string(),
            }
        };
        // Listeners run outside the lock; they may transition again.
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_state_change(&event);
        }
        Ok(())
    }

    /// Playback finished: Speaking -> Listening.
    pub fn on_audio_complete(&self) {
        if self.state() == TurnState::Speaking {
            let _ = self.transition(TurnState::Listening, "audio playback complete");
        }
    }

    /// STT activity while the agent speaks; past the threshold this is a
    /// barge-in: emit StartInterruption and return to Listening.
    pub fn on_stt_input(&self, duration: Duration) {
        if self.state() != TurnState::Speaking || duration <= self.barge_in_threshold {
            return;
        }
        let emitter = self.emitter.lock().clone();
        if let Some(emitter) = emitter {
            let mut m = Meta::new();
            m.insert(meta::SOURCE.to_string(), "turn".to_string());
            m.insert(meta::REASON.to_string(), "barge_in".to_string());
            emitter.emit(Frame::control("", now_pts(), ControlCode::StartInterruption, m));
        }
        let _ = self.transition(TurnState::Listening, "barge-in detected");
    }
}

pub(super) fn now_pts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let sm = StateMachine::new(Duration::from_millis(500));
        sm.transition(TurnState::Listening, "speech").unwrap();
        sm.transition(TurnState::Thinking, "final").unwrap();
        sm.transition(TurnState::Speaking, "reply").unwrap();
        sm.transition(TurnState::Listening, "done").unwrap();
        assert_eq!(sm.state(), TurnState::Listening);
    }

    #[test]
    fn rejects_edges_outside_the_graph() {
        let sm = StateMachine::new(Duration::from_millis(500));
        // Idle -> Thinking is not allowed.
        assert!(sm.transition(TurnState::Thinking, "invalid").is_err());
        assert_eq!(sm.state(), TurnState::Idle);

        sm.transition(TurnState::Listening, "speech").unwrap();
        sm.transition(TurnState::Thinking, "final").unwrap();
        sm.transition(TurnState::Speaking, "reply").unwrap();
        // Speaking -> Thinking must never be reported.
        assert!(sm.transition(TurnState::Thinking, "invalid").is_err());
        assert_eq!(sm.state(), TurnState::Speaking);
    }

    #[test]
    fn listeners_see_every_transition() {
        struct Recorder(Mutex<Vec<(TurnState, TurnState)>>);
        impl StateListener for Recorder {
            fn on_state_change(&self, event: &StateChange) {
                self.0.lock().push((event.from, event.to));
            }
        }
        let sm = StateMachine::new(Duration::from_millis(500));
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        sm.add_listener(rec.clone());
        sm.transition(TurnState::Listening, "a").unwrap();
        sm.transition(TurnState::Thinking, "b").unwrap();
        let seen = rec.0.lock().clone();
        assert_eq!(
            seen,
            vec![
                (TurnState::Idle, TurnState::Listening),
                (TurnState::Listening, TurnState::Thinking)
            ]
        );
    }

    #[test]
    fn audio_complete_only_applies_while_speaking() {
        let sm = StateMachine::new(Duration::from_millis(500));
        sm.on_audio_complete();
        assert_eq!(sm.state(), TurnState::Idle);
        sm.transition(TurnState::Listening, "a").unwrap();
        sm.transition(TurnState::Thinking, "b").unwrap();
        sm.transition(TurnState::Speaking, "c").unwrap();
        sm.on_audio_complete();
        assert_eq!(sm.state(), TurnState::Listening);
    }

    #[test]
    fn barge_in_emits_interruption_past_threshold() {
        struct Captured(Mutex<Vec<Frame>>);
        impl FrameEmitter for Captured {
            fn emit(&self, frame: Frame) {
                self.0.lock().push(frame);
            }
        }
        let sm = StateMachine::new(Duration::from_millis(100));
        let emitted = Arc::new(Captured(Mutex::new(Vec::new())));
        sm.set_emitter(emitted.clone());
        sm.transition(TurnState::Listening, "a").unwrap();
        sm.transition(TurnState::Thinking, "b").unwrap();
        sm.transition(TurnState::Speaking, "c").unwrap();

        sm.on_stt_input(Duration::from_millis(50));
        assert_eq!(sm.state(), TurnState::Speaking, "below threshold");

        sm.on_stt_input(Duration::from_millis(200));
        assert_eq!(sm.state(), TurnState::Listening);
        let frames = emitted.0.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].control_code(), Some(ControlCode::StartInterruption));
        assert_eq!(frames[0].meta_value(meta::REASON), "barge_in");
    }
}
