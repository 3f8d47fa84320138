//! The frame model.
//!
//! Frames are the only currency of the pipeline: typed messages carrying a
//! presentation timestamp (nanoseconds) and a `string -> string` metadata
//! map. Audio and image payloads may borrow their byte buffers from
//! process-wide pools; pooled buffers must be released exactly once via
//! [`release_frame`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::meta;

/// Frame metadata map.
pub type Meta = HashMap<String, String>;

/// Frame kind discriminant, useful for metrics tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Audio,
    Text,
    Control,
    System,
    Image,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Audio => "audio",
            FrameKind::Text => "text",
            FrameKind::Control => "control",
            FrameKind::System => "system",
            FrameKind::Image => "image",
        }
    }
}

/// Control frame codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    Cancel,
    Flush,
    StartInterruption,
    Fallback,
    Handoff,
    ToolCall,
    AudioReady,
    Dtmf,
}

impl ControlCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCode::Cancel => "cancel",
            ControlCode::Flush => "flush",
            ControlCode::StartInterruption => "start_interruption",
            ControlCode::Fallback => "fallback",
            ControlCode::Handoff => "handoff",
            ControlCode::ToolCall => "tool_call",
            ControlCode::AudioReady => "audio_ready",
            ControlCode::Dtmf => "dtmf",
        }
    }
}

/// Payload buffer that may originate from a pool.
///
/// A pooled payload returns its buffer to the pool when dropped, so release
/// happens exactly once no matter which path consumed the frame (sink
/// emission, processor error, or plain drop). Cloning always yields an
/// unpooled copy; a clone can never release the original buffer.
#[derive(Debug)]
pub struct Payload {
    data: Vec<u8>,
    pool: Option<&'static BufferPool>,
}

impl Payload {
    fn owned(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Clone for Payload {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            pool: None,
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

/// A typed pipeline message. Immutable after construction.
#[derive(Debug, Clone)]
pub enum Frame {
    Audio {
        pts: i64,
        payload: Payload,
        sample_rate: u32,
        channels: u16,
        meta: Meta,
    },
    Text {
        pts: i64,
        text: String,
        meta: Meta,
    },
    Control {
        pts: i64,
        code: ControlCode,
        meta: Meta,
    },
    System {
        pts: i64,
        name: String,
        meta: Meta,
    },
    Image {
        pts: i64,
        payload: Payload,
        mime: String,
        url: String,
        meta: Meta,
    },
}

fn merge_meta(stream_id: &str, extra: Meta) -> Meta {
    let mut out = Meta::with_capacity(extra.len() + 1);
    if !stream_id.is_empty() {
        out.insert(meta::STREAM_ID.to_string(), stream_id.to_string());
    }
    out.extend(extra);
    out
}

impl Frame {
    pub fn audio(
        stream_id: &str,
        pts: i64,
        data: Vec<u8>,
        sample_rate: u32,
        channels: u16,
        meta: Meta,
    ) -> Frame {
        Frame::Audio {
            pts,
            payload: Payload::owned(data),
            sample_rate,
            channels,
            meta: merge_meta(stream_id, meta),
        }
    }

    /// Audio frame whose payload is copied into a pooled buffer.
    pub fn audio_pooled(
        stream_id: &str,
        pts: i64,
        data: &[u8],
        sample_rate: u32,
        channels: u16,
        meta: Meta,
    ) -> Frame {
        Frame::Audio {
            pts,
            payload: AUDIO_POOL.acquire(data),
            sample_rate,
            channels,
            meta: merge_meta(stream_id, meta),
        }
    }

    pub fn text(stream_id: &str, pts: i64, text: impl Into<String>, meta: Meta) -> Frame {
        Frame::Text {
            pts,
            text: text.into(),
            meta: merge_meta(stream_id, meta),
        }
    }

    pub fn control(stream_id: &str, pts: i64, code: ControlCode, meta: Meta) -> Frame {
        Frame::Control {
            pts,
            code,
            meta: merge_meta(stream_id, meta),
        }
    }

    pub fn system(stream_id: &str, pts: i64, name: impl Into<String>, meta: Meta) -> Frame {
        Frame::System {
            pts,
            name: name.into(),
            meta: merge_meta(stream_id, meta),
        }
    }

    pub fn image(
        stream_id: &str,
        pts: i64,
        data: Vec<u8>,
        mime: impl Into<String>,
        url: impl Into<String>,
        meta: Meta,
    ) -> Frame {
        Frame::Image {
            pts,
            payload: Payload::owned(data),
            mime: mime.into(),
            url: url.into(),
            meta: merge_meta(stream_id, meta),
        }
    }

    /// Image frame whose payload is copied into a pooled buffer.
    pub fn image_pooled(
        stream_id: &str,
        pts: i64,
        data: &[u8],
        mime: impl Into<String>,
        url: impl Into<String>,
        meta: Meta,
    ) -> Frame {
        Frame::Image {
            pts,
            payload: IMAGE_POOL.acquire(data),
            mime: mime.into(),
            url: url.into(),
            meta: merge_meta(stream_id, meta),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Audio { .. } => FrameKind::Audio,
            Frame::Text { .. } => FrameKind::Text,
            Frame::Control { .. } => FrameKind::Control,
            Frame::System { .. } => FrameKind::System,
            Frame::Image { .. } => FrameKind::Image,
        }
    }

    pub fn pts(&self) -> i64 {
        match self {
            Frame::Audio { pts, .. }
            | Frame::Text { pts, .. }
            | Frame::Control { pts, .. }
            | Frame::System { pts, .. }
            | Frame::Image { pts, .. } => *pts,
        }
    }

    /// Shallow clone of the metadata map. Mutating the returned map never
    /// leaks back into the frame.
    pub fn meta(&self) -> Meta {
        self.meta_ref().clone()
    }

    fn meta_ref(&self) -> &Meta {
        match self {
            Frame::Audio { meta, .. }
            | Frame::Text { meta, .. }
            | Frame::Control { meta, .. }
            | Frame::System { meta, .. }
            | Frame::Image { meta, .. } => meta,
        }
    }

    /// Borrowed metadata lookup, empty string when absent.
    pub fn meta_value(&self, key: &str) -> &str {
        self.meta_ref().get(key).map(String::as_str).unwrap_or("")
    }

    pub fn stream_id(&self) -> &str {
        self.meta_value(meta::STREAM_ID)
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.meta_value(meta::IS_FINAL).to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )
    }

    /// Control code when this is a control frame.
    pub fn control_code(&self) -> Option<ControlCode> {
        match self {
            Frame::Control { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// System frame name, empty otherwise.
    pub fn system_name(&self) -> &str {
        match self {
            Frame::System { name, .. } => name,
            _ => "",
        }
    }
}

/// Explicit release point for a consumed frame. Pooled payloads go back to
/// their pool on drop, so this is equivalent to dropping the frame; it
/// exists to mark the spots where the pipeline ends a frame's life.
/// Returns true when a buffer actually went back to a pool.
pub fn release_frame(frame: Frame) -> bool {
    let pooled = match &frame {
        Frame::Audio { payload, .. } | Frame::Image { payload, .. } => payload.is_pooled(),
        _ => false,
    };
    drop(frame);
    pooled
}

/// Acquire/release balance of a pool, for leak detection in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
}

#[derive(Debug)]
struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    min_capacity: usize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    const fn new(min_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            min_capacity,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    fn acquire(&'static self, data: &[u8]) -> Payload {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let mut buf = self.free.lock().pop().unwrap_or_default();
        if buf.capacity() < data.len() {
            buf.reserve(data.len().next_power_of_two().max(self.min_capacity));
        }
        buf.clear();
        buf.extend_from_slice(data);
        Payload {
            data: buf,
            pool: Some(self),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.free.lock().push(buf);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

static AUDIO_POOL: BufferPool = BufferPool::new(4096);
static IMAGE_POOL: BufferPool = BufferPool::new(8192);

pub fn audio_pool_stats() -> PoolStats {
    AUDIO_POOL.stats()
}

pub fn image_pool_stats() -> PoolStats {
    IMAGE_POOL.stats()
}

/// Monotonic PTS source for producers without a hardware clock.
///
/// Advances one millisecond per call, independently per stream.
#[derive(Default)]
pub struct PtsGenerator {
    values: Mutex<HashMap<String, i64>>,
}

impl PtsGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, stream_id: &str) -> i64 {
        let mut values = self.values.lock();
        let v = values.entry(stream_id.to_string()).or_insert(0);
        *v += 1_000_000;
        *v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_merge_stream_id() {
        let f = Frame::text("s1", 42, "halo", Meta::new());
        assert_eq!(f.stream_id(), "s1");
        assert_eq!(f.pts(), 42);
        assert_eq!(f.kind(), FrameKind::Text);
    }

    #[test]
    fn meta_is_shallow_cloned() {
        let f = Frame::text("s1", 0, "x", Meta::new());
        let mut m = f.meta();
        m.insert("poison".into(), "yes".into());
        assert_eq!(f.meta_value("poison"), "");
    }

    #[test]
    fn pooled_audio_releases_exactly_once() {
        let before = audio_pool_stats();
        let f = Frame::audio_pooled("s1", 0, &[1u8; 320], 8000, 1, Meta::new());
        assert!(release_frame(f));
        let after = audio_pool_stats();
        assert_eq!(after.acquired - before.acquired, 1);
        assert_eq!(after.released - before.released, 1);
    }

    #[test]
    fn cloned_pooled_frame_is_unpooled() {
        let before = audio_pool_stats();
        let f = Frame::audio_pooled("s1", 0, &[0u8; 160], 8000, 1, Meta::new());
        let copy = f.clone();
        assert!(!release_frame(copy));
        assert!(release_frame(f));
        let after = audio_pool_stats();
        assert_eq!(after.released - before.released, 1);
    }

    #[test]
    fn dropping_pooled_frame_releases_it() {
        let before = audio_pool_stats();
        {
            let _f = Frame::audio_pooled("s1", 0, &[0u8; 160], 8000, 1, Meta::new());
        }
        let after = audio_pool_stats();
        assert_eq!(after.acquired - before.acquired, 1);
        assert_eq!(after.released - before.released, 1);
    }

    #[test]
    fn unpooled_release_is_noop() {
        let f = Frame::audio("s1", 0, vec![0u8; 160], 8000, 1, Meta::new());
        assert!(!release_frame(f));
    }

    #[test]
    fn pts_generator_is_monotonic_per_stream() {
        let gen = PtsGenerator::new();
        let a1 = gen.next("a");
        let b1 = gen.next("b");
        let a2 = gen.next("a");
        assert!(a2 > a1);
        assert_eq!(a1, b1);
    }

    #[test]
    fn is_final_accepts_variants() {
        let mut m = Meta::new();
        m.insert(crate::meta::IS_FINAL.to_string(), "True".to_string());
        assert!(Frame::text("s", 0, "x", m).is_final());
        assert!(!Frame::text("s", 0, "x", Meta::new()).is_final());
    }
}
