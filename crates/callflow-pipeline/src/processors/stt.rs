//! The STT processor.
//!
//! One vendor session per stream, created lazily on the first audio frame.
//! A bounded replay buffer of recent chunks is re-sent to a fresh session
//! after a reconnect; repeated rate-limit failures open a circuit breaker
//! that degrades the stream to `Fallback` controls instead of vendor calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use callflow_core::{
    meta, redact, CircuitBreaker, ControlCode, Frame, FrameProcessor, Meta, ReasonCode, Result,
    RetryPolicy, StreamingStt,
};
use callflow_observe::{Observer, ObserverEvent};

use super::now_pts;

pub type SttFactory = Arc<dyn Fn(&str, &str) -> Arc<dyn StreamingStt> + Send + Sync>;

type QuestionDetector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct ReplayChunk {
    data: Vec<u8>,
    rate: u32,
    channels: u16,
}

#[derive(Default)]
struct SttState {
    sessions: HashMap<String, Arc<dyn StreamingStt>>,
    lang_factories: HashMap<String, SttFactory>,
    default_lang: String,
    code_switching: bool,
    stream_lang: HashMap<String, String>,
    call_stream: HashMap<String, String>,
    stream_call: HashMap<String, String>,
    replay_max: usize,
    replay: HashMap<String, VecDeque<ReplayChunk>>,
    from: HashMap<String, String>,
    trace: HashMap<String, String>,
    interim_logged: HashSet<String>,
    forward_interim: bool,
    provider: String,
    breaker_open: bool,
}

pub struct SttProcessor {
    factory: SttFactory,
    state: Mutex<SttState>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    cancel: Mutex<CancellationToken>,
    observer: Mutex<Option<Arc<dyn Observer>>>,
    question: Mutex<Option<QuestionDetector>>,
}

impl SttProcessor {
    pub fn new(factory: SttFactory) -> Self {
        Self {
            factory,
            state: Mutex::new(SttState {
                replay_max: 50,
                ..Default::default()
            }),
            breaker: CircuitBreaker::new(3, Duration::from_secs(30)),
            retry: RetryPolicy::new(2, Duration::from_millis(200)),
            cancel: Mutex::new(CancellationToken::new()),
            observer: Mutex::new(None),
            question: Mutex::new(None),
        }
    }

    pub fn set_cancel(&self, cancel: CancellationToken) {
        *self.cancel.lock() = cancel;
    }

    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn set_language_factories(&self, factories: HashMap<String, SttFactory>, default_lang: &str) {
        let mut state = self.state.lock();
        state.lang_factories = factories;
        state.default_lang = default_lang.to_string();
    }

    pub fn set_code_switching(&self, enabled: bool) {
        self.state.lock().code_switching = enabled;
    }

    pub fn set_replay_chunks(&self, max_chunks: usize) {
        let mut state = self.state.lock();
        state.replay_max = max_chunks;
        if max_chunks == 0 {
            state.replay.clear();
        }
    }

    pub fn set_forward_interim(&self, enabled: bool) {
        self.state.lock().forward_interim = enabled;
    }

    pub fn set_question_detector(&self, detector: QuestionDetector) {
        *self.question.lock() = Some(detector);
    }

    pub async fn close_stream(&self, stream_id: &str) {
        if stream_id.is_empty() {
            return;
        }
        let session = {
            let mut state = self.state.lock();
            let session = state.sessions.remove(stream_id);
            if let Some(call_sid) = state.stream_call.remove(stream_id) {
                if state.call_stream.get(&call_sid).map(String::as_str) == Some(stream_id) {
                    state.call_stream.remove(&call_sid);
                }
            }
            state.from.remove(stream_id);
            state.trace.remove(stream_id);
            state.stream_lang.remove(stream_id);
            state.replay.remove(stream_id);
            session
        };
        if let Some(session) = session {
            let _ = session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<dyn StreamingStt>> = {
            let mut state = self.state.lock();
            let sessions = state.sessions.drain().map(|(_, s)| s).collect();
            state.from.clear();
            state.trace.clear();
            state.stream_lang.clear();
            state.call_stream.clear();
            state.stream_call.clear();
            state.replay.clear();
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

    async fn get_or_create(&self, stream_id: &str, call_sid: &str) -> Result<Arc<dyn StreamingStt>> {
        let factory = {
            let state = self.state.lock();
            if let Some(session) = state.sessions.get(stream_id) {
                return Ok(session.clone());
            }
            let lang = state
                .stream_lang
                .get(stream_id)
                .cloned()
                .unwrap_or_else(|| state.default_lang.clone());
            state
                .lang_factories
                .get(&lang)
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
        state
            .sessions
            .insert(stream_id.to_string(), session.clone());
        Ok(session)
    }

    fn add_replay(&self, stream_id: &str, frame: &Frame) {
        if stream_id.is_empty() {
            return;
        }
        let Frame::Audio {
            payload,
            sample_rate,
            channels,
            ..
        } = frame
        else {
            return;
        };
        let mut state = self.state.lock();
        let max = state.replay_max;
        if max == 0 {
            return;
        }
        let buf = state.replay.entry(stream_id.to_string()).or_default();
        buf.push_back(ReplayChunk {
            data: payload.as_slice().to_vec(),
            rate: *sample_rate,
            channels: *channels,
        });
        while buf.len() > max {
            buf.pop_front();
        }
    }

    async fn replay_to_session(&self, stream_id: &str, session: &Arc<dyn StreamingStt>) {
        let chunks: Vec<Frame> = {
            let state = self.state.lock();
            match state.replay.get(stream_id) {
                Some(buf) => buf
                    .iter()
                    .filter(|c| !c.data.is_empty())
                    .map(|c| {
                        Frame::audio(
                            stream_id,
                            now_pts(),
                            c.data.clone(),
                            c.rate,
                            c.channels,
                            Meta::new(),
                        )
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        for frame in &chunks {
            let _ = session.send_audio(frame).await;
        }
    }

    fn drain_results(&self, session: &Arc<dyn StreamingStt>, stream_id: &str) -> Vec<Frame> {
        let mut out = Vec::new();
        let (question, forward_interim) = {
            let state = self.state.lock();
            (self.question.lock().clone(), state.forward_interim)
        };
        while let Some(frame) = session.try_recv() {
            if let Frame::Text { text, .. } = &frame {
                let is_question = question.as_ref().map(|q| q(text)).unwrap_or(false);
                if is_question {
                    let mut m = Meta::new();
                    m.insert(meta::SOURCE.to_string(), "stt".to_string());
                    m.insert(meta::REASON.to_string(), "question".to_string());
                    if let Some(trace) = self.trace_for(stream_id) {
                        m.insert(meta::TRACE_ID.to_string(), trace);
                    }
                    out.push(Frame::control(stream_id, now_pts(), ControlCode::Flush, m));
                }
                if !frame.is_final() {
                    self.log_interim(stream_id, text);
                    if forward_interim {
                        out.push(frame);
                    }
                    continue;
                }
                self.log_final(stream_id, text);
                self.record("stt_final", stream_id);
                out.push(frame);
                continue;
            }
            out.push(frame);
        }
        self.attach_stream_meta(out, stream_id)
    }

    /// Back-fills from_number and trace_id onto transcript frames.
    fn attach_stream_meta(&self, frames: Vec<Frame>, stream_id: &str) -> Vec<Frame> {
        let (from, trace) = {
            let state = self.state.lock();
            (
                state.from.get(stream_id).cloned().unwrap_or_default(),
                state.trace.get(stream_id).cloned().unwrap_or_default(),
            )
        };
        if from.is_empty() && trace.is_empty() {
            return frames;
        }
        frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Text { pts, text, meta: mut m } => {
                    if !from.is_empty() && !m.contains_key(meta::FROM_NUMBER) {
                        m.insert(meta::FROM_NUMBER.to_string(), from.clone());
                    }
                    if !trace.is_empty() && !m.contains_key(meta::TRACE_ID) {
                        m.insert(meta::TRACE_ID.to_string(), trace.clone());
                    }
                    Frame::text(stream_id, pts, text, m)
                }
                other => other,
            })
            .collect()
    }

    fn trace_for(&self, stream_id: &str) -> Option<String> {
        self.state.lock().trace.get(stream_id).cloned()
    }

    fn log_interim(&self, stream_id: &str, text: &str) {
        let (trace, first) = {
            let mut state = self.state.lock();
            let first = state.interim_logged.insert(stream_id.to_string());
            (
                state.trace.get(stream_id).cloned().unwrap_or_default(),
                first,
            )
        };
        if first {
            tracing::info!(
                stream_id,
                trace_id = %trace,
                text = %redact::clip(&redact::text(text)),
                "stt_interim"
            );
        }
    }

    fn log_final(&self, stream_id: &str, text: &str) {
        let trace = self.trace_for(stream_id).unwrap_or_default();
        let safe = redact::text(text);
        tracing::info!(
            stream_id,
            trace_id = %trace,
            text = %redact::clip(&safe),
            "stt_final"
        );
        if let Some(observer) = self.observer.lock().clone() {
            observer.record(
                ObserverEvent::new("stt_final_text")
                    .with_tag(meta::STREAM_ID, stream_id)
                    .with_tag(meta::TRACE_ID, &trace)
                    .with_tag("component", "stt")
                    .with_field("text", serde_json::Value::String(safe)),
            );
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
                    .with_tag("component", "stt")
                    .with_tag("provider", &provider),
            );
        }
    }

    fn record_audio_in(&self, stream_id: &str, frame: &Frame) {
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
        let trace = self.trace_for(stream_id).unwrap_or_default();
        observer.record(
            ObserverEvent::new("audio_in")
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
impl FrameProcessor for SttProcessor {
    fn name(&self) -> &'static str {
        "stt_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        if let Frame::System { name, .. } = &frame {
            let stream_id = frame.stream_id().to_string();
            if name == "call_end" {
                let stream_id = if stream_id.is_empty() {
                    let call = frame.meta_value(meta::CALL_SID);
                    self.state
                        .lock()
                        .call_stream
                        .get(call)
                        .cloned()
                        .unwrap_or_default()
                } else {
                    stream_id
                };
                if !stream_id.is_empty() {
                    self.close_stream(&stream_id).await;
                }
                return Ok(vec![frame]);
            }
            let lang = frame.meta_value(meta::GLOBAL_LANGUAGE);
            if !stream_id.is_empty() && !lang.is_empty() {
                let (close, has_factories) = {
                    let mut state = self.state.lock();
                    state
                        .stream_lang
                        .insert(stream_id.clone(), lang.trim().to_ascii_lowercase());
                    (!state.code_switching, !state.lang_factories.is_empty())
                };
                // Without code switching, the next audio frame opens a
                // session in the new language.
                if close && has_factories {
                    self.close_stream(&stream_id).await;
                }
            }
            return Ok(vec![frame]);
        }
        if frame.kind() != callflow_core::FrameKind::Audio {
            return Ok(vec![frame]);
        }

        let meta_map = frame.meta();
        let stream_id = frame.stream_id().to_string();
        let call_sid = meta_map.get(meta::CALL_SID).cloned().unwrap_or_default();
        self.track_call_stream(&call_sid, &stream_id).await;
        self.add_replay(&stream_id, &frame);
        {
            let mut state = self.state.lock();
            if let Some(from) = meta_map.get(meta::FROM_NUMBER).filter(|v| !v.is_empty()) {
                state.from.insert(stream_id.clone(), from.clone());
            }
            if let Some(trace) = meta_map.get(meta::TRACE_ID).filter(|v| !v.is_empty()) {
                state.trace.insert(stream_id.clone(), trace.clone());
            }
        }

        if !self.breaker.allow() {
            self.record("breaker_denied", &stream_id);
            self.set_breaker_open(true, &stream_id);
            tracing::info!(
                stream_id = %stream_id,
                reason_code = %ReasonCode::SttCircuitOpen,
                "stt_circuit_open"
            );
            callflow_core::release_frame(frame);
            return Ok(vec![Frame::control(
                &stream_id,
                now_pts(),
                ControlCode::Fallback,
                meta_map,
            )]);
        }
        self.set_breaker_open(false, &stream_id);

        let session = match self.get_or_create(&stream_id, &call_sid).await {
            Ok(session) => session,
            Err(err) => {
                let err = err.with_reason(ReasonCode::SttConnect);
                tracing::info!(
                    stream_id = %stream_id,
                    call_sid = %call_sid,
                    reason_code = %err.reason(),
                    error = %err,
                    "stt_session_error"
                );
                self.record_rate_limit(&err, &stream_id);
                self.breaker.on_error(&err);
                callflow_core::release_frame(frame);
                return Ok(vec![Frame::control(
                    &stream_id,
                    now_pts(),
                    ControlCode::Fallback,
                    meta_map,
                )]);
            }
        };

        self.record("stt_audio_in", &stream_id);
        self.record_audio_in(&stream_id, &frame);

        let mut session = session;
        if let Err(err) = session.send_audio(&frame).await {
            let err = err.with_reason(ReasonCode::SttSend);
            tracing::info!(
                stream_id = %stream_id,
                call_sid = %call_sid,
                reason_code = %err.reason(),
                error = %err,
                "stt_send_error"
            );
            // Close, recreate, replay the recent window once, then retry
            // the original frame.
            let replayed = AtomicBool::new(false);
            let cancel = self.cancel.lock().clone();
            let this = &*self;
            let frame_ref = &frame;
            let sid = stream_id.clone();
            let csid = call_sid.clone();
            let result = self
                .retry
                .run(&cancel, || {
                    let sid = sid.clone();
                    let csid = csid.clone();
                    let replayed = &replayed;
                    async move {
                        this.close_stream(&sid).await;
                        let session = this.get_or_create(&sid, &csid).await?;
                        if !replayed.swap(true, Ordering::SeqCst) {
                            this.replay_to_session(&sid, &session).await;
                        }
                        session.send_audio(frame_ref).await?;
                        Ok(session)
                    }
                })
                .await;
            match result {
                Ok(fresh) => session = fresh,
                Err(retry_err) => {
                    let retry_err = retry_err.with_reason(ReasonCode::SttRetry);
                    tracing::info!(
                        stream_id = %stream_id,
                        call_sid = %call_sid,
                        reason_code = %retry_err.reason(),
                        error = %retry_err,
                        "stt_retry_error"
                    );
                    self.record_rate_limit(&retry_err, &stream_id);
                    self.breaker.on_error(&retry_err);
                    callflow_core::release_frame(frame);
                    return Ok(vec![Frame::control(
                        &stream_id,
                        now_pts(),
                        ControlCode::Fallback,
                        meta_map,
                    )]);
                }
            }
        }
        self.breaker.on_success();
        let heartbeat_pts = frame.pts();
        callflow_core::release_frame(frame);

        // Heartbeat keeps downstream timers on the pipeline clock even
        // when the vendor produces no results for a while.
        let mut out = vec![Frame::system(&stream_id, heartbeat_pts, "heartbeat", Meta::new())];
        out.extend(self.drain_results(&session, &stream_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockStt;

    fn audio(stream: &str, call: &str) -> Frame {
        let mut m = Meta::new();
        if !call.is_empty() {
            m.insert(meta::CALL_SID.to_string(), call.to_string());
        }
        m.insert(meta::TRACE_ID.to_string(), "TR1".to_string());
        Frame::audio(stream, now_pts(), vec![0u8; 160], 8000, 1, m)
    }

    fn processor_with(mock: Arc<MockStt>) -> SttProcessor {
        let session = mock;
        SttProcessor::new(Arc::new(move |_call, _stream| {
            session.clone() as Arc<dyn StreamingStt>
        }))
    }

    #[tokio::test]
    async fn lazy_session_and_transcript_forwarding() {
        let mock = MockStt::new();
        mock.push_final("halo");
        let p = processor_with(mock.clone());
        let out = p.process(audio("S1", "CA1")).await.unwrap();
        assert_eq!(mock.started(), 1);
        assert_eq!(out[0].system_name(), "heartbeat");
        let text = out
            .iter()
            .find_map(|f| match f {
                Frame::Text { text, meta: m, .. } => Some((text.clone(), m.clone())),
                _ => None,
            })
            .expect("final transcript");
        assert_eq!(text.0, "halo");
        assert_eq!(text.1.get(meta::TRACE_ID).unwrap(), "TR1");
    }

    #[tokio::test]
    async fn interims_are_absorbed_by_default() {
        let mock = MockStt::new();
        mock.push_interim("ha");
        let p = processor_with(mock);
        let out = p.process(audio("S1", "")).await.unwrap();
        assert!(out.iter().all(|f| f.kind() != callflow_core::FrameKind::Text));
    }

    #[tokio::test]
    async fn send_failure_reconnects_and_replays() {
        let mock = MockStt::new();
        mock.fail_sends(1);
        let p = processor_with(mock.clone());
        // Prime the replay buffer with an earlier chunk.
        p.process(audio("S1", "CA1")).await.unwrap();
        let sent_before = mock.sent_count();
        mock.fail_sends(1);
        let out = p.process(audio("S1", "CA1")).await.unwrap();
        assert!(out.iter().all(|f| f.control_code() != Some(ControlCode::Fallback)));
        // Replayed chunk(s) plus the retried frame arrived after the failure.
        assert!(mock.sent_count() > sent_before + 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_rate_limits() {
        let mock = MockStt::new();
        mock.rate_limit_sends(100);
        let p = processor_with(mock.clone());
        for _ in 0..3 {
            let out = p.process(audio("S1", "CA1")).await.unwrap();
            assert!(out
                .iter()
                .any(|f| f.control_code() == Some(ControlCode::Fallback)));
        }
        // Breaker now open: no vendor call, straight to fallback.
        let calls_before = mock.sent_count();
        let out = p.process(audio("S1", "CA1")).await.unwrap();
        assert!(out
            .iter()
            .any(|f| f.control_code() == Some(ControlCode::Fallback)));
        assert_eq!(mock.sent_count(), calls_before);
    }

    #[tokio::test]
    async fn call_end_closes_the_session() {
        let mock = MockStt::new();
        let p = processor_with(mock.clone());
        p.process(audio("S1", "CA1")).await.unwrap();
        let mut m = Meta::new();
        m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
        p.process(Frame::system("S1", now_pts(), "call_end", m))
            .await
            .unwrap();
        assert_eq!(mock.closed(), 1);
    }

    #[tokio::test]
    async fn new_stream_for_same_call_supersedes_old() {
        let mock = MockStt::new();
        let p = processor_with(mock.clone());
        p.process(audio("S1", "CA1")).await.unwrap();
        p.process(audio("S2", "CA1")).await.unwrap();
        // S1's session was closed when S2 took over the call.
        assert_eq!(mock.closed(), 1);
        assert_eq!(mock.started(), 2);
    }

    #[tokio::test]
    async fn language_update_recreates_session_without_code_switching() {
        let mock = MockStt::new();
        let p = processor_with(mock.clone());
        let mut factories: HashMap<String, SttFactory> = HashMap::new();
        let en_session = mock.clone();
        factories.insert(
            "en".to_string(),
            Arc::new(move |_c, _s| en_session.clone() as Arc<dyn StreamingStt>),
        );
        p.set_language_factories(factories, "id");
        p.set_code_switching(false);

        p.process(audio("S1", "CA1")).await.unwrap();
        let mut m = Meta::new();
        m.insert(meta::GLOBAL_LANGUAGE.to_string(), "en".to_string());
        p.process(Frame::system("S1", now_pts(), "global_update", m))
            .await
            .unwrap();
        assert_eq!(mock.closed(), 1, "session closed for language switch");
        p.process(audio("S1", "CA1")).await.unwrap();
        assert_eq!(mock.started(), 2, "new session for the new language");
    }

    #[tokio::test]
    async fn question_heuristic_emits_flush() {
        let mock = MockStt::new();
        mock.push_final("apakah besok bisa?");
        let p = processor_with(mock);
        p.set_question_detector(Arc::new(|text| text.trim_end().ends_with('?')));
        let out = p.process(audio("S1", "")).await.unwrap();
        let flush = out
            .iter()
            .find(|f| f.control_code() == Some(ControlCode::Flush))
            .expect("question flush");
        assert_eq!(flush.meta_value(meta::REASON), "question");
    }
}
