//! The TTS processor.
//!
//! Vendor sessions are keyed `stream|language` and created lazily. Text is
//! sent with an explicit flush on the final chunk of a reply; audio is
//! drained after every input. Synthesized text continues downstream so the
//! pipeline's output sequence keeps the spoken chunks alongside their
//! audio. Interruption controls purge buffered vendor audio so zombie
//! audio never reaches the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_core::{
    meta, redact, CircuitBreaker, ControlCode, Frame, FrameProcessor, Meta, ReasonCode, Result,
    RetryPolicy, StreamingTts,
};
use callflow_observe::{Observer, ObserverEvent};

use super::now_pts;

pub type TtsFactory = Arc<dyn Fn(&str, &str) -> Arc<dyn StreamingTts> + Send + Sync>;

#[derive(Default)]
struct TtsState {
    sessions: HashMap<String, Arc<dyn StreamingTts>>,
    lang_factories: HashMap<String, TtsFactory>,
    default_lang: String,
    first_audio: HashMap<String, bool>,
    trace: HashMap<String, String>,
    call_stream: HashMap<String, String>,
    stream_call: HashMap<String, String>,
    provider: String,
    breaker_open: bool,
}

pub struct TtsProcessor {
    factory: TtsFactory,
    state: Mutex<TtsState>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    cancel: Mutex<CancellationToken>,
    observer: Mutex<Option<Arc<dyn Observer>>>,
}

impl TtsProcessor {
    pub fn new(factory: TtsFactory) -> Self {
        Self {
            factory,
            state: Mutex::new(TtsState::default()),
            breaker: CircuitBreaker::new(3, Duration::from_secs(30)),
            retry: RetryPolicy::new(2, Duration::from_millis(200)),
            cancel: Mutex::new(CancellationToken::new()),
            observer: Mutex::new(None),
        }
    }

    pub fn set_cancel(&self, cancel: CancellationToken) {
        *self.cancel.lock() = cancel;
    }

    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn set_language_factories(&self, factories: HashMap<String, TtsFactory>, default_lang: &str) {
        let mut state = self.state.lock();
        state.lang_factories = factories;
        state.default_lang = default_lang.to_string();
    }

    fn session_key(stream_id: &str, lang: &str) -> String {
        if lang.is_empty() {
            stream_id.to_string()
        } else {
            format!("{stream_id}|{lang}")
        }
    }

    fn sessions_for(&self, stream_id: &str) -> Vec<Arc<dyn StreamingTts>> {
        if stream_id.is_empty() {
            return Vec::new();
        }
        let prefix = format!("{stream_id}|");
        let state = self.state.lock();
        state
            .sessions
            .iter()
            .filter(|(key, _)| key.as_str() == stream_id || key.starts_with(&prefix))
            .map(|(_, s)| s.clone())
            .collect()
    }

    async fn get_or_create(
        &self,
        stream_id: &str,
        call_sid: &str,
        lang: &str,
    ) -> Result<Arc<dyn StreamingTts>> {
        let key = Self::session_key(stream_id, lang);
        let factory = {
            let state = self.state.lock();
            if let Some(session) = state.sessions.get(&key) {
                return Ok(session.clone());
            }
            state
                .lang_factories
                .get(lang)
                .cloned()
                .unwrap_or_else(|| self.factory.clone())
        };
        let session = factory(call_sid, stream_id);
        let cancel = self.cancel.lock().clone();
        session.start(cancel).await?;
        let mut state = self.state.lock();
        if state.provider.is_empty() {
            state.provider = session.name().to_string();
        }
        state.sessions.insert(key, session.clone());
        tracing::info!(stream_id, "tts session created");
        Ok(session)
    }

    /// Ghost-close guard: closing an empty stream id is a no-op.
    pub async fn close_stream(&self, stream_id: &str) {
        if stream_id.is_empty() {
            tracing::debug!("tts close stream ignored - empty stream id");
            return;
        }
        let sessions = {
            let prefix = format!("{stream_id}|");
            let mut state = self.state.lock();
            let keys: Vec<String> = state
                .sessions
                .keys()
                .filter(|key| key.as_str() == stream_id || key.starts_with(&prefix))
                .cloned()
                .collect();
            let sessions: Vec<Arc<dyn StreamingTts>> = keys
                .iter()
                .filter_map(|key| state.sessions.remove(key))
                .collect();
            if let Some(call_sid) = state.stream_call.remove(stream_id) {
                if state.call_stream.get(&call_sid).map(String::as_str) == Some(stream_id) {
                    state.call_stream.remove(&call_sid);
                }
            }
            state.first_audio.remove(stream_id);
            state.trace.remove(stream_id);
            sessions
        };
        for session in sessions {
            let _ = session.close().await;
        }
    }

    async fn track_call_stream(&self, call_sid: &str, stream_id: &str) {
        if call_sid.is_empty() || stream_id.is_empty() {
            return;
        }
        let superseded = {
            let mut state = self.state.lock();
            let prev = state.call_stream.get(call_sid).cloned();
            state
                .call_stream
                .insert(call_sid.to_string(), stream_id.to_string());
            state
                .stream_call
                .insert(stream_id.to_string(), call_sid.to_string());
            prev.filter(|p| p != stream_id)
        };
        if let Some(prev) = superseded {
            self.close_stream(&prev).await;
        }
    }

    /// Emits buffered vendor audio downstream.
    fn drain(&self, stream_id: &str, out: &mut Vec<Frame>) {
        let mut drained = Vec::new();
        for session in self.sessions_for(stream_id) {
            while let Some(frame) = session.try_recv() {
                drained.push(frame);
            }
        }
        if drained.is_empty() {
            return;
        }
        self.record_first_audio(stream_id);
        for frame in &drained {
            self.record_audio_out(stream_id, frame);
        }
        out.extend(drained);
    }

    /// Discards buffered vendor audio so none of it reaches the transport.
    fn purge(&self, stream_id: &str) {
        for session in self.sessions_for(stream_id) {
            while let Some(frame) = session.try_recv() {
                callflow_core::release_frame(frame);
            }
        }
    }

    async fn flush_sessions(&self, stream_id: &str) {
        for session in self.sessions_for(stream_id) {
            let _ = session.flush().await;
        }
    }

    fn record_first_audio(&self, stream_id: &str) {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(
                state.first_audio.entry(stream_id.to_string()).or_insert(false),
                true,
            )
        };
        if first {
            self.record("tts_first_audio", stream_id);
        }
    }

    fn record(&self, name: &str, stream_id: &str) {
        if let Some(observer) = self.observer.lock().clone() {
            let (trace, call_sid, provider) = {
                let state = self.state.lock();
                (
                    state.trace.get(stream_id).cloned().unwrap_or_default(),
                    state.stream_call.get(stream_id).cloned().unwrap_or_default(),
                    state.provider.clone(),
                )
            };
            observer.record(
                ObserverEvent::new(name)
                    .with_tag(meta::STREAM_ID, stream_id)
                    .with_tag(meta::TRACE_ID, &trace)
                    .with_tag(meta::CALL_SID, &call_sid)
                    .with_tag("component", "tts")
                    .with_tag("provider", &provider),
            );
        }
    }

    fn record_audio_out(&self, stream_id: &str, frame: &Frame) {
        let Some(observer) = self.observer.lock().clone() else {
            return;
        };
        let Frame::Audio {
            payload,
            sample_rate,
            channels,
            ..
        } = frame
        else {
            return;
        };
        let trace = self
            .state
            .lock()
            .trace
            .get(stream_id)
            .cloned()
            .unwrap_or_default();
        observer.record(
            ObserverEvent::new("audio_out")
                .with_tag(meta::STREAM_ID, stream_id)
                .with_tag(meta::TRACE_ID, &trace)
                .with_field("payload_bytes", serde_json::json!(payload.len()))
                .with_field("sample_rate", serde_json::json!(sample_rate))
                .with_field("channels", serde_json::json!(channels)),
        );
    }

    fn record_rate_limit(&self, err: &callflow_core::Error, stream_id: &str) {
        if err.is_rate_limit() {
            self.record("rate_limit", stream_id);
        }
    }

    fn set_breaker_open(&self, open: bool, stream_id: &str) {
        let changed = {
            let mut state = self.state.lock();
            if state.breaker_open == open {
                false
            } else {
                state.breaker_open = open;
                true
            }
        };
        if changed {
            self.record(
                if open { "breaker_open" } else { "breaker_close" },
                stream_id,
            );
        }
    }
}

#[async_trait]
impl FrameProcessor for TtsProcessor {
    fn name(&self) -> &'static str {
        "tts_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        let stream_id = frame.stream_id().to_string();
        let call_sid = frame.meta_value(meta::CALL_SID).to_string();
        if !call_sid.is_empty() {
            self.track_call_stream(&call_sid, &stream_id).await;
        }
        let lang = {
            let from_meta = frame.meta_value(meta::LANGUAGE).to_string();
            if from_meta.is_empty() {
                self.state.lock().default_lang.clone()
            } else {
                from_meta
            }
        };
        let mut out = Vec::new();

        match &frame {
            Frame::System { name, .. } => {
                if name == "call_end" {
                    let stream_id = if stream_id.is_empty() {
                        self.state
                            .lock()
                            .call_stream
                            .get(&call_sid)
                            .cloned()
                            .unwrap_or_default()
                    } else {
                        stream_id
                    };
                    if !stream_id.is_empty() {
                        self.close_stream(&stream_id).await;
                    }
                }
                out.push(frame);
                Ok(out)
            }
            Frame::Control { code, .. } => {
                match code {
                    ControlCode::StartInterruption | ControlCode::Flush => {
                        // Barge-in path: purge pending vendor audio, then
                        // tell the vendor to stop synthesizing.
                        self.purge(&stream_id);
                        self.flush_sessions(&stream_id).await;
                        tracing::info!(stream_id = %stream_id, code = code.as_str(), "tts interrupt");
                    }
                    ControlCode::Cancel | ControlCode::Fallback => {
                        self.purge(&stream_id);
                        self.close_stream(&stream_id).await;
                        tracing::info!(stream_id = %stream_id, code = code.as_str(), "tts closed on control");
                    }
                    ControlCode::AudioReady => {
                        self.drain(&stream_id, &mut out);
                    }
                    _ => {}
                }
                out.push(frame);
                Ok(out)
            }
            Frame::Text { text, .. } => {
                let meta_map = frame.meta();
                if let Some(trace) = meta_map.get(meta::TRACE_ID).filter(|t| !t.is_empty()) {
                    self.state
                        .lock()
                        .trace
                        .insert(stream_id.clone(), trace.clone());
                }
                let flush_requested = frame.meta_value(meta::TTS_FLUSH) == "true";
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    if flush_requested {
                        for session in self.sessions_for(&stream_id) {
                            let _ = session.send_text_with_options("", true).await;
                        }
                    }
                    self.drain(&stream_id, &mut out);
                    return Ok(out);
                }

                if !self.breaker.allow() {
                    self.record("breaker_denied", &stream_id);
                    self.set_breaker_open(true, &stream_id);
                    tracing::warn!(
                        stream_id = %stream_id,
                        reason_code = %ReasonCode::TtsCircuitOpen,
                        "tts circuit breaker open"
                    );
                    self.drain(&stream_id, &mut out);
                    out.push(Frame::control(
                        &stream_id,
                        now_pts(),
                        ControlCode::Fallback,
                        meta_map,
                    ));
                    return Ok(out);
                }
                self.set_breaker_open(false, &stream_id);

                let session = match self.get_or_create(&stream_id, &call_sid, &lang).await {
                    Ok(session) => session,
                    Err(err) => {
                        let err = err.with_reason(ReasonCode::TtsConnect);
                        tracing::error!(
                            stream_id = %stream_id,
                            reason_code = %err.reason(),
                            error = %err,
                            "tts connection failed"
                        );
                        self.record_rate_limit(&err, &stream_id);
                        self.breaker.on_error(&err);
                        self.drain(&stream_id, &mut out);
                        out.push(Frame::control(
                            &stream_id,
                            now_pts(),
                            ControlCode::Fallback,
                            meta_map,
                        ));
                        return Ok(out);
                    }
                };

                tracing::info!(
                    stream_id = %stream_id,
                    text = %redact::clip(&redact::text(trimmed)),
                    text_length = trimmed.len(),
                    "tts request"
                );

                let send_result = if flush_requested {
                    session.send_text_with_options(trimmed, true).await
                } else {
                    session.send_text(trimmed).await
                };

                if let Err(err) = send_result {
                    let err = err.with_reason(ReasonCode::TtsSend);
                    tracing::error!(
                        stream_id = %stream_id,
                        reason_code = %err.reason(),
                        error = %err,
                        "tts send failed"
                    );
                    // Close and recreate, then re-send through the retry
                    // policy.
                    let cancel = self.cancel.lock().clone();
                    let this = &*self;
                    let sid = stream_id.clone();
                    let csid = call_sid.clone();
                    let lang_ref = lang.clone();
                    let text_ref = trimmed;
                    let result = self
                        .retry
                        .run(&cancel, || {
                            let sid = sid.clone();
                            let csid = csid.clone();
                            let lang = lang_ref.clone();
                            async move {
                                this.close_stream(&sid).await;
                                let session = this.get_or_create(&sid, &csid, &lang).await?;
                                session.send_text(text_ref).await
                            }
                        })
                        .await;
                    if let Err(retry_err) = result {
                        let retry_err = retry_err.with_reason(ReasonCode::TtsRetry);
                        tracing::error!(
                            stream_id = %stream_id,
                            reason_code = %retry_err.reason(),
                            error = %retry_err,
                            "tts send failed after retry"
                        );
                        self.record_rate_limit(&retry_err, &stream_id);
                        self.breaker.on_error(&retry_err);
                        self.drain(&stream_id, &mut out);
                        out.push(Frame::control(
                            &stream_id,
                            now_pts(),
                            ControlCode::Fallback,
                            meta_map,
                        ));
                        return Ok(out);
                    }
                }

                self.breaker.on_success();
                self.drain(&stream_id, &mut out);
                out.push(frame);
                Ok(out)
            }
            _ => {
                self.drain(&stream_id, &mut out);
                out.push(frame);
                Ok(out)
            }
        }
    }
}
