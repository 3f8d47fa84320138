//! Filler audio during agent thinking.
//!
//! On `thinking_start`, plays a pre-loaded clip chunked into fixed-size
//! telephony frames, once per stream until `thinking_end`, a flush/cancel,
//! or call end clears the gate. The clip is loaded from a file at
//! construction; `.b64` files are base64-decoded.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;

use callflow_core::{meta, ControlCode, Frame, FrameProcessor, Meta, Result};

/// 20 ms of 8 kHz mono mu-law.
const CHUNK_BYTES: usize = 160;

pub struct FillerProcessor {
    chunks: Vec<Vec<u8>>,
    active: Mutex<HashSet<String>>,
}

impl FillerProcessor {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut raw = load_filler(path.as_ref());
        if raw.len() < CHUNK_BYTES {
            // Mu-law silence keeps the line alive when no clip is supplied.
            raw = vec![0xFF; CHUNK_BYTES * 5];
        }
        let chunks = raw
            .chunks_exact(CHUNK_BYTES)
            .map(|c| c.to_vec())
            .collect();
        Self {
            chunks,
            active: Mutex::new(HashSet::new()),
        }
    }

    fn play(&self, stream_id: &str, meta_map: &Meta) -> Vec<Frame> {
        if !self.active.lock().insert(stream_id.to_string()) {
            return Vec::new();
        }
        self.chunks
            .iter()
            .map(|chunk| {
                let mut m = Meta::new();
                m.insert(meta::ENCODING.to_string(), "mulaw".to_string());
                for (k, v) in meta_map {
                    m.insert(k.clone(), v.clone());
                }
                Frame::audio_pooled(stream_id, 0, chunk, 8000, 1, m)
            })
            .collect()
    }

    fn clear(&self, stream_id: &str) {
        self.active.lock().remove(stream_id);
    }
}

#[async_trait]
impl FrameProcessor for FillerProcessor {
    fn name(&self) -> &'static str {
        "filler"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        match &frame {
            Frame::System { name, .. } => {
                let stream_id = frame.stream_id().to_string();
                match name.as_str() {
                    "call_end" => {
                        self.clear(&stream_id);
                        Ok(vec![frame])
                    }
                    "thinking_start" => {
                        let mut out = self.play(&stream_id, &frame.meta());
                        out.push(frame);
                        Ok(out)
                    }
                    "thinking_end" => {
                        self.clear(&stream_id);
                        Ok(vec![frame])
                    }
                    _ => Ok(vec![frame]),
                }
            }
            Frame::Control { code, .. } => {
                if matches!(code, ControlCode::Flush | ControlCode::Cancel) {
                    self.clear(frame.stream_id());
                }
                Ok(vec![frame])
            }
            _ => Ok(vec![frame]),
        }
    }
}

fn load_filler(path: &Path) -> Vec<u8> {
    let Ok(raw) = std::fs::read(path) else {
        return Vec::new();
    };
    if path.extension().is_some_and(|ext| ext == "b64") {
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim();
        if !text.is_empty() {
            if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(text) {
                if !decoded.is_empty() {
                    return decoded;
                }
            }
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thinking(name: &str) -> Frame {
        Frame::system("S1", 1, name, Meta::new())
    }

    #[tokio::test]
    async fn plays_chunks_once_per_thinking_phase() {
        let p = FillerProcessor::new("/nonexistent/filler.ulaw");
        let out = p.process(thinking("thinking_start")).await.unwrap();
        let audio = out
            .iter()
            .filter(|f| f.kind() == callflow_core::FrameKind::Audio)
            .count();
        assert_eq!(audio, 5);
        // Second thinking_start while active: no more filler.
        let out = p.process(thinking("thinking_start")).await.unwrap();
        let audio = out
            .iter()
            .filter(|f| f.kind() == callflow_core::FrameKind::Audio)
            .count();
        assert_eq!(audio, 0);

        // thinking_end rearms the gate.
        p.process(thinking("thinking_end")).await.unwrap();
        let out = p.process(thinking("thinking_start")).await.unwrap();
        assert!(out
            .iter()
            .any(|f| f.kind() == callflow_core::FrameKind::Audio));
    }

    #[tokio::test]
    async fn flush_clears_the_gate() {
        let p = FillerProcessor::new("/nonexistent/filler.ulaw");
        p.process(thinking("thinking_start")).await.unwrap();
        p.process(Frame::control("S1", 1, ControlCode::Flush, Meta::new()))
            .await
            .unwrap();
        let out = p.process(thinking("thinking_start")).await.unwrap();
        assert!(out
            .iter()
            .any(|f| f.kind() == callflow_core::FrameKind::Audio));
    }

    #[tokio::test]
    async fn loads_b64_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.b64");
        let clip = vec![0x7Fu8; CHUNK_BYTES * 2];
        std::fs::write(
            &path,
            base64::engine::general_purpose::STANDARD.encode(&clip),
        )
        .unwrap();
        let p = FillerProcessor::new(&path);
        let out = p.process(thinking("thinking_start")).await.unwrap();
        let audio: Vec<_> = out
            .iter()
            .filter(|f| f.kind() == callflow_core::FrameKind::Audio)
            .collect();
        assert_eq!(audio.len(), 2);
        match audio[0] {
            Frame::Audio { payload, .. } => assert_eq!(payload.as_slice()[0], 0x7F),
            other => panic!("unexpected {other:?}"),
        }
    }
}
