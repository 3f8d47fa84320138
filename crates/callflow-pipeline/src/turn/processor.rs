//! TurnProcessor: drives the turn manager from the frame path.
//!
//! Listens to STT flush controls, transcripts, LLM output and system
//! events, owns the silence-reprompt and end-of-turn safety timers, and
//! injects the manager's control frames (barge-in Flush/Cancel,
//! StartInterruption) back into the chain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use callflow_config::{SilenceRepromptConfig, TurnConfig};
use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Meta, Result};

use super::fsm::now_pts;
use super::manager::{FrameEmitter, Strategy, TurnManager};
use super::TurnState;

#[derive(Debug, Clone)]
pub struct TurnProcessorConfig {
    pub barge_in_threshold: Duration,
    pub min_barge_in: Duration,
    pub end_of_turn_timeout: Duration,
    pub silence_reprompt: Option<SilenceRepromptConfig>,
}

impl TurnProcessorConfig {
    pub fn from_config(cfg: &TurnConfig) -> Self {
        Self {
            barge_in_threshold: Duration::from_millis(cfg.barge_in_threshold_ms),
            min_barge_in: Duration::from_millis(cfg.min_barge_in_ms),
            end_of_turn_timeout: Duration::from_millis(cfg.end_of_turn_timeout_ms),
            silence_reprompt: cfg.silence_reprompt.clone(),
        }
    }
}

impl Default for TurnProcessorConfig {
    fn default() -> Self {
        Self::from_config(&TurnConfig::default())
    }
}

struct ChannelEmitter {
    tx: mpsc::Sender<Frame>,
}

impl FrameEmitter for ChannelEmitter {
    fn emit(&self, frame: Frame) {
        let _ = self.tx.try_send(frame);
    }
}

#[derive(Default)]
struct ProcState {
    last_stream: String,
    last_language: String,
    last_trace: String,
    reprompt_count: u32,
    speech_started: Option<Instant>,
    silence_timer: Option<CancellationToken>,
    eot_timer: Option<CancellationToken>,
    eot_stream: String,
}

pub struct TurnProcessor {
    mgr: Arc<TurnManager>,
    emit_tx: mpsc::Sender<Frame>,
    emit_rx: Mutex<mpsc::Receiver<Frame>>,
    state: Arc<Mutex<ProcState>>,
    silence: Option<SilenceRepromptConfig>,
    end_of_turn: Duration,
}

impl TurnProcessor {
    pub fn new(strategy: Arc<dyn Strategy>, cfg: TurnProcessorConfig) -> Self {
        let (emit_tx, emit_rx) = mpsc::channel(32);
        let emitter = Arc::new(ChannelEmitter {
            tx: emit_tx.clone(),
        });
        let mgr = TurnManager::new(
            strategy,
            emitter,
            cfg.barge_in_threshold,
            cfg.min_barge_in,
        );
        let mut silence = cfg.silence_reprompt;
        if let Some(s) = &mut silence {
            if s.max_attempts == 0 {
                s.max_attempts = 2;
            }
            if s.timeout_ms == 0 {
                s.timeout_ms = 10_000;
            }
        }
        Self {
            mgr,
            emit_tx,
            emit_rx: Mutex::new(emit_rx),
            state: Arc::new(Mutex::new(ProcState::default())),
            silence,
            end_of_turn: cfg.end_of_turn_timeout,
        }
    }

    /// The underlying manager, for callers outside the frame path.
    pub fn manager(&self) -> Arc<TurnManager> {
        self.mgr.clone()
    }

    fn drain(&self) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut rx = self.emit_rx.lock();
        while let Ok(frame) = rx.try_recv() {
            out.push(self.ensure_stream_id(frame));
        }
        out
    }

    /// Manager-emitted frames carry no stream id; back-fill the last one
    /// seen on this pipeline.
    fn ensure_stream_id(&self, frame: Frame) -> Frame {
        let last = self.state.lock().last_stream.clone();
        if last.is_empty() || !frame.stream_id().is_empty() {
            return frame;
        }
        let mut m = frame.meta();
        m.insert(meta::STREAM_ID.to_string(), last.clone());
        m.entry(meta::SOURCE.to_string())
            .or_insert_with(|| "turn".to_string());
        match frame {
            Frame::Control { pts, code, .. } => Frame::control(&last, pts, code, m),
            Frame::System { pts, name, .. } => Frame::system(&last, pts, name, m),
            Frame::Text { pts, text, .. } => Frame::text(&last, pts, text, m),
            other => other,
        }
    }

    fn on_user_speech_start(&self, stream_id: &str) {
        self.state.lock().speech_started.get_or_insert_with(Instant::now);
        self.mgr.on_user_speech_start();
        self.start_end_of_turn_timer(stream_id);
    }

    fn on_user_speech_end(&self) {
        self.state.lock().speech_started = None;
        self.stop_end_of_turn_timer();
        self.mgr.on_user_speech_end();
    }

    fn start_silence_timer(&self) {
        let Some(cfg) = self.silence.clone() else {
            return;
        };
        let mut state = self.state.lock();
        if let Some(old) = state.silence_timer.take() {
            old.cancel();
        }
        let stream_id = state.last_stream.clone();
        if stream_id.is_empty() {
            return;
        }
        let token = CancellationToken::new();
        state.silence_timer = Some(token.clone());
        drop(state);

        let state = self.state.clone();
        let emit = self.emit_tx.clone();
        let timeout = Duration::from_millis(cfg.timeout_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                let mut s = state.lock();
                if s.reprompt_count >= cfg.max_attempts {
                    return;
                }
                s.reprompt_count += 1;
                let attempt = s.reprompt_count;
                let language = s.last_language.to_ascii_lowercase();
                let trace = s.last_trace.clone();
                drop(s);

                let mut prompt = cfg.prompt_text.clone();
                if !language.is_empty() {
                    if let Some(localized) = cfg.prompt_by_language.get(&language) {
                        if !localized.is_empty() {
                            prompt = localized.clone();
                        }
                    }
                }
                let mut m = Meta::new();
                m.insert(meta::GREETING_TEXT.to_string(), prompt);
                m.insert(meta::REPROMPT_ATTEMPT.to_string(), attempt.to_string());
                if !language.is_empty() {
                    m.insert(meta::LANGUAGE.to_string(), language.clone());
                }
                if !trace.is_empty() {
                    m.insert(meta::TRACE_ID.to_string(), trace);
                }
                let _ = emit.try_send(Frame::system(&stream_id, now_pts(), "reprompt", m));
                if attempt >= cfg.max_attempts {
                    return;
                }
            }
        });
    }

    fn reset_silence_timer(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.silence_timer.take() {
            timer.cancel();
        }
        state.reprompt_count = 0;
    }

    fn start_end_of_turn_timer(&self, stream_id: &str) {
        if self.end_of_turn.is_zero() || stream_id.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(old) = state.eot_timer.take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        state.eot_timer = Some(token.clone());
        state.eot_stream = stream_id.to_string();
        let trace = state.last_trace.clone();
        drop(state);

        let mgr = self.mgr.clone();
        let emit = self.emit_tx.clone();
        let timeout = self.end_of_turn;
        let stream_id = stream_id.to_string();
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            {
                let mut s = state.lock();
                if s.eot_stream != stream_id {
                    return;
                }
                s.eot_timer = None;
            }
            // Vendor missed end-of-utterance; close the turn ourselves.
            mgr.on_user_speech_end();
            let mut m = Meta::new();
            m.insert(meta::SOURCE.to_string(), "turn".to_string());
            m.insert(meta::REASON.to_string(), "speech_timeout".to_string());
            if !trace.is_empty() {
                m.insert(meta::TRACE_ID.to_string(), trace);
            }
            let _ = emit.try_send(Frame::control(&stream_id, now_pts(), ControlCode::Flush, m));
        });
    }

    fn stop_end_of_turn_timer(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.eot_timer.take() {
            timer.cancel();
        }
        state.eot_stream.clear();
    }
}

fn is_end_of_turn_reason(reason: &str) -> bool {
    matches!(
        reason.trim().to_ascii_lowercase().as_str(),
        "utterance_end" | "speech_final" | "question" | "speech_timeout"
    )
}

#[async_trait]
impl FrameProcessor for TurnProcessor {
    fn name(&self) -> &'static str {
        "turn_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        {
            let mut state = self.state.lock();
            let trace = frame.meta_value(meta::TRACE_ID);
            if !trace.is_empty() {
                state.last_trace = trace.to_string();
            }
            let stream = frame.stream_id();
            if !stream.is_empty() {
                state.last_stream = stream.to_string();
            }
        }

        let mut out = self.drain();
        match &frame {
            Frame::Control { code, .. } => match code {
                ControlCode::Flush => {
                    let source = frame.meta_value(meta::SOURCE);
                    if matches!(source, "stt" | "vad" | "audio_gate") {
                        if is_end_of_turn_reason(frame.meta_value(meta::REASON)) {
                            self.on_user_speech_end();
                        } else {
                            self.on_user_speech_start(frame.stream_id());
                        }
                    }
                    self.reset_silence_timer();
                }
                ControlCode::AudioReady => {
                    self.mgr.on_audio_complete();
                    self.start_silence_timer();
                }
                _ => {}
            },
            Frame::Text { .. } => {
                let lang = frame.meta_value(meta::LANGUAGE);
                if !lang.is_empty() {
                    self.state.lock().last_language = lang.to_string();
                }
                match frame.meta_value(meta::SOURCE) {
                    "stt" => {
                        self.reset_silence_timer();
                        if frame.is_final() {
                            self.on_user_speech_end();
                        } else {
                            // Interim speech while the agent talks may be a
                            // barge-in once it lasts past the threshold.
                            if self.mgr.state() == TurnState::Speaking {
                                let since = self.state.lock().speech_started;
                                if let Some(since) = since {
                                    self.mgr.on_stt_input(since.elapsed());
                                }
                            }
                            self.on_user_speech_start(frame.stream_id());
                        }
                    }
                    "llm" => {
                        self.mgr.on_agent_speech_start();
                        self.reset_silence_timer();
                    }
                    _ => {}
                }
            }
            Frame::System { name, .. } => match name.as_str() {
                "thinking_start" => self.mgr.on_agent_think_start(),
                "thinking_end" => self.mgr.on_agent_think_end(),
                "call_end" => {
                    self.reset_silence_timer();
                    self.stop_end_of_turn_timer();
                    self.state.lock().last_trace.clear();
                }
                _ => {}
            },
            _ => {}
        }
        out.push(frame);
        out.extend(self.drain());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::AggressiveStrategy;

    fn stt_text(text: &str, is_final: bool) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::IS_FINAL.to_string(), is_final.to_string());
        Frame::text("S1", now_pts(), text, m)
    }

    fn llm_text(text: &str) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "llm".to_string());
        Frame::text("S1", now_pts(), text, m)
    }

    fn processor(cfg: TurnProcessorConfig) -> TurnProcessor {
        TurnProcessor::new(Arc::new(AggressiveStrategy), cfg)
    }

    #[tokio::test]
    async fn transcript_flow_drives_the_fsm() {
        let p = processor(TurnProcessorConfig::default());
        p.process(stt_text("ha", false)).await.unwrap();
        assert_eq!(p.manager().state(), TurnState::Listening);
        p.process(stt_text("halo", true)).await.unwrap();
        assert_eq!(p.manager().state(), TurnState::Thinking);
        p.process(llm_text("Hai!")).await.unwrap();
        assert_eq!(p.manager().state(), TurnState::Speaking);
        p.process(Frame::control("S1", now_pts(), ControlCode::AudioReady, Meta::new()))
            .await
            .unwrap();
        assert_eq!(p.manager().state(), TurnState::Listening);
    }

    #[tokio::test]
    async fn vad_flush_reasons_split_start_and_end() {
        let p = processor(TurnProcessorConfig::default());
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::REASON.to_string(), "speech_started".to_string());
        p.process(Frame::control("S1", now_pts(), ControlCode::Flush, m))
            .await
            .unwrap();
        assert_eq!(p.manager().state(), TurnState::Listening);

        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::REASON.to_string(), "utterance_end".to_string());
        p.process(Frame::control("S1", now_pts(), ControlCode::Flush, m))
            .await
            .unwrap();
        assert_eq!(p.manager().state(), TurnState::Thinking);
    }

    #[tokio::test]
    async fn silence_reprompt_fires_with_greeting_text() {
        let cfg = TurnProcessorConfig {
            silence_reprompt: Some(SilenceRepromptConfig {
                timeout_ms: 30,
                max_attempts: 2,
                prompt_text: "Masih di sana?".to_string(),
                prompt_by_language: Default::default(),
            }),
            ..Default::default()
        };
        let p = processor(cfg);
        p.process(stt_text("halo", true)).await.unwrap();
        p.process(llm_text("Hai!")).await.unwrap();
        p.process(Frame::control("S1", now_pts(), ControlCode::AudioReady, Meta::new()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Any frame flowing drains the pending reprompt.
        let out = p
            .process(Frame::system("S1", now_pts(), "heartbeat", Meta::new()))
            .await
            .unwrap();
        let reprompt = out
            .iter()
            .find(|f| f.system_name() == "reprompt")
            .expect("reprompt expected");
        assert_eq!(reprompt.meta_value(meta::GREETING_TEXT), "Masih di sana?");
        assert_eq!(reprompt.meta_value(meta::REPROMPT_ATTEMPT), "1");
        assert_eq!(reprompt.stream_id(), "S1");
    }

    #[tokio::test]
    async fn user_audio_resets_reprompt_counter() {
        let cfg = TurnProcessorConfig {
            silence_reprompt: Some(SilenceRepromptConfig {
                timeout_ms: 20,
                max_attempts: 1,
                prompt_text: "halo?".to_string(),
                prompt_by_language: Default::default(),
            }),
            ..Default::default()
        };
        let p = processor(cfg);
        p.process(stt_text("halo", true)).await.unwrap();
        p.process(llm_text("Hai!")).await.unwrap();
        p.process(Frame::control("S1", now_pts(), ControlCode::AudioReady, Meta::new()))
            .await
            .unwrap();
        // User speaks before the timer fires.
        p.process(stt_text("saya", false)).await.unwrap();
        assert_eq!(p.state.lock().reprompt_count, 0);
    }

    #[tokio::test]
    async fn end_of_turn_timer_synthesizes_speech_timeout_flush() {
        let cfg = TurnProcessorConfig {
            end_of_turn_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let p = processor(cfg);
        p.process(stt_text("halo tanpa akhir", false)).await.unwrap();
        assert_eq!(p.manager().state(), TurnState::Listening);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let out = p
            .process(Frame::system("S1", now_pts(), "heartbeat", Meta::new()))
            .await
            .unwrap();
        let flush = out
            .iter()
            .find(|f| f.control_code() == Some(ControlCode::Flush))
            .expect("synthesized flush expected");
        assert_eq!(flush.meta_value(meta::REASON), "speech_timeout");
        assert_eq!(p.manager().state(), TurnState::Thinking);
    }

    #[tokio::test]
    async fn final_transcript_cancels_end_of_turn_timer() {
        let cfg = TurnProcessorConfig {
            end_of_turn_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let p = processor(cfg);
        p.process(stt_text("halo", false)).await.unwrap();
        p.process(stt_text("halo dunia", true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let out = p
            .process(Frame::system("S1", now_pts(), "heartbeat", Meta::new()))
            .await
            .unwrap();
        assert!(out
            .iter()
            .all(|f| f.control_code() != Some(ControlCode::Flush)));
    }
}
