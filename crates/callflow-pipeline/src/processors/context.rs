//! Context assembly.
//!
//! Injects the base prompt once per scope, tracks `global_*` facts and
//! re-emits a shared-context frame when they change, rewrites DTMF and
//! image frames as text, and aggregates transcripts. With a turn manager
//! attached, transcripts go through the speculative buffer and the
//! LLM-triggering user turn is emitted on the Listening -> Thinking
//! transition.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;

use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Meta, Result};

use super::context_buffer::{ContextBuffer, ContextBufferOptions};
use super::now_pts;
use crate::aggregator::{AggregatorConfig, TextAggregator};
use crate::turn::TurnManager;

/// Free-form meta key marking a raw final transcript forwarded for
/// visibility only; the speculative flush frame is the LLM trigger.
pub const TRANSCRIPT_ONLY: &str = "transcript_only";

#[derive(Default)]
struct Inner {
    aggs: HashMap<String, Arc<TextAggregator>>,
    injected: HashSet<String>,
    global: HashMap<String, BTreeMap<String, String>>,
    global_hash: HashMap<String, String>,
}

pub struct ContextProcessor {
    agg_cfg: AggregatorConfig,
    base_prompt: String,
    default_caption: Mutex<String>,
    inner: Mutex<Inner>,
    buffer: Mutex<Option<Arc<ContextBuffer>>>,
    pending: Arc<Mutex<Vec<Frame>>>,
}

impl ContextProcessor {
    pub fn new(agg_cfg: AggregatorConfig, base_prompt: impl Into<String>) -> Self {
        Self {
            agg_cfg,
            base_prompt: base_prompt.into(),
            default_caption: Mutex::new("User image".to_string()),
            inner: Mutex::new(Inner::default()),
            buffer: Mutex::new(None),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach the turn manager: transcripts become speculative and the user
    /// turn flushes on the Listening -> Thinking transition.
    pub fn set_turn_manager(&self, tm: &Arc<TurnManager>) {
        let pending = self.pending.clone();
        let buffer = Arc::new(ContextBuffer::new(
            ContextBufferOptions::default(),
            Box::new(move |content| {
                let mut m = Meta::new();
                m.insert(meta::IS_FINAL.to_string(), "true".to_string());
                m.insert(meta::SOURCE.to_string(), "stt".to_string());
                let tf = Frame::text("", now_pts(), content, m);
                pending.lock().push(tf);
                Ok(())
            }),
        ));
        tm.add_listener(buffer.clone());
        *self.buffer.lock() = Some(buffer);
    }

    pub fn set_default_caption(&self, caption: impl Into<String>) {
        *self.default_caption.lock() = caption.into();
    }

    fn agg_for(&self, stream_id: &str) -> Arc<TextAggregator> {
        let key = if stream_id.is_empty() {
            "default"
        } else {
            stream_id
        };
        let mut inner = self.inner.lock();
        inner
            .aggs
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TextAggregator::new(self.agg_cfg.clone())))
            .clone()
    }

    fn scope_key(meta_map: &Meta) -> String {
        let call = meta_map
            .get(meta::CALL_SID)
            .map(String::as_str)
            .unwrap_or("");
        if !call.is_empty() {
            return call.to_string();
        }
        meta_map
            .get(meta::STREAM_ID)
            .cloned()
            .unwrap_or_default()
    }

    /// Emits the base prompt once per scope.
    fn build_base_prompt(&self, meta_map: &Meta) -> Option<Frame> {
        if self.base_prompt.is_empty() {
            return None;
        }
        let stream_id = meta_map
            .get(meta::STREAM_ID)
            .map(String::as_str)
            .unwrap_or("");
        let scope = Self::scope_key(meta_map);
        if stream_id.is_empty() || scope.is_empty() {
            return None;
        }
        {
            let mut inner = self.inner.lock();
            if !inner.injected.insert(scope) {
                return None;
            }
        }
        let mut m = Meta::new();
        m.insert(meta::SYSTEM_MESSAGE.to_string(), self.base_prompt.clone());
        if let Some(trace) = meta_map.get(meta::TRACE_ID) {
            m.insert(meta::TRACE_ID.to_string(), trace.clone());
        }
        Some(Frame::system(stream_id, now_pts(), "base_prompt", m))
    }

    fn update_global(&self, meta_map: &Meta) {
        let scope = Self::scope_key(meta_map);
        if scope.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let globals = inner.global.entry(scope).or_default();
        for (k, v) in meta_map {
            if v.is_empty() {
                continue;
            }
            if let Some(stripped) = k.strip_prefix(meta::GLOBAL_PREFIX) {
                globals.insert(stripped.to_string(), v.clone());
            }
        }
        if let Some(from) = meta_map.get(meta::FROM_NUMBER) {
            if !from.is_empty() {
                globals.insert("customer_id".to_string(), from.clone());
            }
        }
    }

    /// Emits a shared-context frame whenever the global set's hash changes.
    fn build_global_message(&self, meta_map: &Meta) -> Option<Frame> {
        let stream_id = meta_map
            .get(meta::STREAM_ID)
            .map(String::as_str)
            .unwrap_or("");
        let scope = Self::scope_key(meta_map);
        if stream_id.is_empty() || scope.is_empty() {
            return None;
        }
        let hash = {
            let mut inner = self.inner.lock();
            let globals = inner.global.get(&scope)?;
            if globals.is_empty() {
                return None;
            }
            let hash = globals
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            if inner.global_hash.get(&scope) == Some(&hash) {
                return None;
            }
            inner.global_hash.insert(scope, hash.clone());
            hash
        };
        let mut m = Meta::new();
        m.insert(
            meta::SYSTEM_MESSAGE.to_string(),
            format!("Shared context: {hash}"),
        );
        if let Some(trace) = meta_map.get(meta::TRACE_ID) {
            m.insert(meta::TRACE_ID.to_string(), trace.clone());
        }
        Some(Frame::system(stream_id, now_pts(), "global_context", m))
    }

    fn clear_scope(&self, meta_map: &Meta) {
        let scope = Self::scope_key(meta_map);
        if scope.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.injected.remove(&scope);
        inner.global.remove(&scope);
        inner.global_hash.remove(&scope);
        if let Some(stream) = meta_map.get(meta::STREAM_ID) {
            inner.aggs.remove(stream);
        }
    }

    /// Run a synthesized user text frame through prompt injection and the
    /// aggregator.
    fn emit_user_text(&self, tf: Frame, out: &mut Vec<Frame>) {
        let meta_map = tf.meta();
        if let Some(sys) = self.build_base_prompt(&meta_map) {
            out.push(sys);
        }
        if let Some(sys) = self.build_global_message(&meta_map) {
            out.push(sys);
        }
        let agg = self.agg_for(tf.stream_id());
        out.extend(agg.process(tf));
    }

    fn take_pending(&self, out: &mut Vec<Frame>) {
        let pending: Vec<Frame> = std::mem::take(&mut *self.pending.lock());
        for frame in pending {
            self.emit_user_text(frame, out);
        }
    }
}

#[async_trait]
impl FrameProcessor for ContextProcessor {
    fn name(&self) -> &'static str {
        "context_processor"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        let mut out = Vec::new();
        // Speculative flushes surface on the next frame through the stage.
        self.take_pending(&mut out);

        // Pending frames carry no stream id of their own; borrow this
        // frame's id so downstream stages can route them.
        if !frame.stream_id().is_empty() {
            for pending in &mut out {
                if pending.stream_id().is_empty() {
                    if let Frame::Text { meta: m, .. } = pending {
                        m.insert(
                            meta::STREAM_ID.to_string(),
                            frame.stream_id().to_string(),
                        );
                    }
                }
            }
        }

        match &frame {
            Frame::System { name, .. } => {
                let meta_map = frame.meta();
                self.update_global(&meta_map);
                if name == "call_end" {
                    self.clear_scope(&meta_map);
                }
                if let Some(sys) = self.build_base_prompt(&meta_map) {
                    out.push(sys);
                }
                out.push(frame);
                Ok(out)
            }
            Frame::Control { code, .. } => {
                match code {
                    ControlCode::Dtmf => {
                        let mut meta_map = frame.meta();
                        let digit = meta_map
                            .get(meta::DTMF_DIGIT)
                            .cloned()
                            .unwrap_or_default();
                        if !digit.is_empty() {
                            meta_map.insert(meta::SOURCE.to_string(), "dtmf".to_string());
                            meta_map.insert(meta::IS_FINAL.to_string(), "true".to_string());
                            let stream_id = frame.stream_id().to_string();
                            let tf = Frame::text(
                                &stream_id,
                                now_pts(),
                                format!("DTMF input: {digit}"),
                                meta_map,
                            );
                            self.emit_user_text(tf, &mut out);
                        }
                    }
                    ControlCode::Flush => {
                        let buffer = self.buffer.lock().clone();
                        if let Some(buffer) = buffer {
                            buffer.flush();
                            self.take_pending(&mut out);
                            if !frame.stream_id().is_empty() {
                                for pending in &mut out {
                                    if pending.stream_id().is_empty() {
                                        if let Frame::Text { meta: m, .. } = pending {
                                            m.insert(
                                                meta::STREAM_ID.to_string(),
                                                frame.stream_id().to_string(),
                                            );
                                        }
                                    }
                                }
                            }
                        } else {
                            let agg = self.agg_for(frame.stream_id());
                            if let Some(tf) = agg.flush_frame() {
                                self.emit_user_text(tf, &mut out);
                            }
                        }
                    }
                    _ => {}
                }
                out.push(frame);
                Ok(out)
            }
            Frame::Text { .. } => {
                let buffer = self.buffer.lock().clone();
                if let Some(buffer) = buffer {
                    if !frame.stream_id().is_empty() {
                        buffer.set_stream_id(frame.stream_id());
                    }
                    let is_final = frame.is_final();
                    match &frame {
                        Frame::Text { text, .. } => buffer.add_transcript(text, is_final),
                        _ => unreachable!(),
                    }
                    if !is_final {
                        // Interim transcripts never leave the buffer.
                        return Ok(out);
                    }
                    // Finals are forwarded for transcript visibility; the
                    // buffered flush is the actual LLM trigger.
                    let mut m = frame.meta();
                    m.insert(TRANSCRIPT_ONLY.to_string(), "true".to_string());
                    let stream_id = frame.stream_id().to_string();
                    match frame {
                        Frame::Text { pts, text, .. } => {
                            out.push(Frame::text(&stream_id, pts, text, m))
                        }
                        _ => unreachable!(),
                    }
                    return Ok(out);
                }

                if !frame.is_final() {
                    return Ok(out);
                }
                self.emit_user_text(frame, &mut out);
                Ok(out)
            }
            Frame::Image { .. } => {
                let mut meta_map = frame.meta();
                let caption = {
                    let given = meta_map
                        .get(meta::IMAGE_CAPTION)
                        .cloned()
                        .unwrap_or_default();
                    if given.is_empty() {
                        self.default_caption.lock().clone()
                    } else {
                        given
                    }
                };
                let stream_id = frame.stream_id().to_string();
                if let Frame::Image { payload, url, mime, .. } = &frame {
                    if !url.is_empty() {
                        meta_map.insert(meta::IMAGE_URL.to_string(), url.clone());
                    } else if !payload.is_empty() {
                        let sniffed = if mime.is_empty() {
                            detect_image_mime(payload.as_slice())
                        } else {
                            mime.clone()
                        };
                        if sniffed.starts_with("image/") {
                            meta_map.insert(meta::IMAGE_MIME.to_string(), sniffed);
                            meta_map.insert(
                                meta::IMAGE_BASE64.to_string(),
                                base64::engine::general_purpose::STANDARD
                                    .encode(payload.as_slice()),
                            );
                        } else {
                            tracing::warn!(
                                stream_id = %stream_id,
                                mime = %sniffed,
                                "context_invalid_image_mime"
                            );
                            meta_map.remove(meta::IMAGE_BASE64);
                        }
                    }
                }
                callflow_core::release_frame(frame);
                out.push(Frame::text(&stream_id, now_pts(), caption, meta_map));
                Ok(out)
            }
            Frame::Audio { .. } => {
                out.push(frame);
                Ok(out)
            }
        }
    }
}

fn detect_image_mime(data: &[u8]) -> String {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png".to_string();
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg".to_string();
    }
    if data.starts_with(b"GIF8") {
        return "image/gif".to_string();
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp".to_string();
    }
    "application/octet-stream".to_string()
}
