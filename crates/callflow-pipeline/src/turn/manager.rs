//! Turn manager: translates pipeline events into state transitions and
//! barge-in control frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use callflow_core::{meta, ControlCode, Frame, Meta};

use super::fsm::{now_pts, StateListener, StateMachine, TurnState};

/// Where the manager's control frames go (normally the TurnProcessor's
/// internal channel, drained into the frame path).
pub trait FrameEmitter: Send + Sync {
    fn emit(&self, frame: Frame);
}

/// Barge-in policy.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn barge_in_enabled(&self) -> bool;
}

/// Interrupt the agent as soon as the user speaks long enough.
pub struct AggressiveStrategy;

impl Strategy for AggressiveStrategy {
    fn name(&self) -> &'static str {
        "aggressive"
    }
    fn barge_in_enabled(&self) -> bool {
        true
    }
}

/// Let the agent finish; user speech never interrupts.
pub struct PoliteStrategy;

impl Strategy for PoliteStrategy {
    fn name(&self) -> &'static str {
        "polite"
    }
    fn barge_in_enabled(&self) -> bool {
        false
    }
}

pub struct TurnManager {
    sm: Arc<StateMachine>,
    strategy: Arc<dyn Strategy>,
    emitter: Arc<dyn FrameEmitter>,
    min_barge_in: Duration,
    last_change: Mutex<Instant>,
    /// Incremented on every user-speech start; pending barge-in timers
    /// compare against it so a stale timer never fires.
    speech_epoch: AtomicU64,
}

impl TurnManager {
    pub fn new(
        strategy: Arc<dyn Strategy>,
        emitter: Arc<dyn FrameEmitter>,
        barge_in_threshold: Duration,
        min_barge_in: Duration,
    ) -> Arc<Self> {
        let sm = Arc::new(StateMachine::new(barge_in_threshold));
        sm.set_emitter(emitter.clone());
        let min_barge_in = if min_barge_in.is_zero() {
            Duration::from_millis(300)
        } else {
            min_barge_in
        };
        Arc::new(Self {
            sm,
            strategy,
            emitter,
            min_barge_in,
            last_change: Mutex::new(Instant::now()),
            speech_epoch: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> TurnState {
        self.sm.state()
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.sm.add_listener(listener);
    }

    fn set_state(&self, to: TurnState, reason: &str) {
        *self.last_change.lock() = Instant::now();
        let _ = self.sm.transition(to, reason);
    }

    pub fn on_user_speech_start(self: &Arc<Self>) {
        let was_speaking = self.sm.state() == TurnState::Speaking;
        self.set_state(TurnState::Listening, "user speech start");
        let epoch = self.speech_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if was_speaking && self.strategy.barge_in_enabled() {
            // Flush only if the user is still talking after the minimum
            // barge-in window; brief noises must not cut the agent off.
            let mgr = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(mgr.min_barge_in).await;
                let still_active = mgr.sm.state() == TurnState::Listening
                    && mgr.speech_epoch.load(Ordering::SeqCst) == epoch;
                if still_active {
                    mgr.emit_barge_in();
                }
            });
        }
    }

    pub fn on_user_speech_end(&self) {
        self.speech_epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(TurnState::Thinking, "user speech end");
    }

    pub fn on_agent_think_start(&self) {
        if self.sm.state() == TurnState::Idle {
            let _ = self
                .sm
                .transition(TurnState::Listening, "agent think start - entering listening");
        }
        self.set_state(TurnState::Thinking, "agent think start");
    }

    pub fn on_agent_think_end(&self) {}

    pub fn on_agent_speech_start(&self) {
        self.set_state(TurnState::Speaking, "agent speech start");
    }

    pub fn on_agent_speech_end(&self) {
        self.set_state(TurnState::Idle, "agent speech end");
    }

    pub fn on_audio_complete(&self) {
        self.sm.on_audio_complete();
    }

    pub fn on_stt_input(&self, duration: Duration) {
        self.sm.on_stt_input(duration);
    }

    pub fn barge_in_latency(&self) -> Duration {
        self.last_change.lock().elapsed()
    }

    fn emit_barge_in(&self) {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "turn".to_string());
        m.insert(meta::REASON.to_string(), "barge_in".to_string());
        self.emitter
            .emit(Frame::control("", now_pts(), ControlCode::Flush, m.clone()));
        self.emitter
            .emit(Frame::control("", now_pts(), ControlCode::Cancel, m));
    }
}
