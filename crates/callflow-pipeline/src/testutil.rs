//! Scripted vendor mocks shared by the processor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_core::{
    meta, Error, Frame, LlmAdapter, LlmContext, LlmResponse, Meta, Result, StreamingStt,
    StreamingTts, TokenStream, ToolCall,
};

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Scripted STT session: queued result frames, injectable send failures.
pub struct MockStt {
    results: Mutex<VecDeque<Frame>>,
    started: AtomicU32,
    closed: AtomicU32,
    sent: AtomicU32,
    fail_next: AtomicU32,
    rate_limit_next: AtomicU32,
}

impl MockStt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::new()),
            started: AtomicU32::new(0),
            closed: AtomicU32::new(0),
            sent: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            rate_limit_next: AtomicU32::new(0),
        })
    }

    pub fn push_final(&self, text: &str) {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::IS_FINAL.to_string(), "true".to_string());
        self.results.lock().push_back(Frame::text("", 0, text, m));
    }

    pub fn push_interim(&self, text: &str) {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::IS_FINAL.to_string(), "false".to_string());
        self.results.lock().push_back(Frame::text("", 0, text, m));
    }

    pub fn push_result(&self, frame: Frame) {
        self.results.lock().push_back(frame);
    }

    /// VAD event: the caller started talking.
    pub fn push_speech_started(&self) {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "stt".to_string());
        m.insert(meta::REASON.to_string(), "speech_started".to_string());
        self.results
            .lock()
            .push_back(Frame::control("", 0, callflow_core::ControlCode::Flush, m));
    }

    pub fn fail_sends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn rate_limit_sends(&self, n: u32) {
        self.rate_limit_next.store(n, Ordering::SeqCst);
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingStt for MockStt {
    fn name(&self) -> &'static str {
        "mock_stt"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_audio(&self, _frame: &Frame) -> Result<()> {
        if take_failure(&self.rate_limit_next) {
            return Err(Error::rate_limit("mock_stt", "429"));
        }
        if take_failure(&self.fail_next) {
            return Err(Error::Vendor("mock stt send failure".into()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_recv(&self) -> Option<Frame> {
        self.results.lock().pop_front()
    }
}

/// Scripted TTS session with a native flush variant.
pub struct MockTts {
    results: Mutex<VecDeque<Frame>>,
    sent_texts: Mutex<Vec<String>>,
    started: AtomicU32,
    closed: AtomicU32,
    flushes: AtomicU32,
    flush_sends: AtomicU32,
    fail_next: AtomicU32,
    rate_limit_next: AtomicU32,
}

impl MockTts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(VecDeque::new()),
            sent_texts: Mutex::new(Vec::new()),
            started: AtomicU32::new(0),
            closed: AtomicU32::new(0),
            flushes: AtomicU32::new(0),
            flush_sends: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            rate_limit_next: AtomicU32::new(0),
        })
    }

    pub fn push_audio(&self, data: Vec<u8>) {
        let mut m = Meta::new();
        m.insert(meta::SOURCE.to_string(), "tts".to_string());
        self.results
            .lock()
            .push_back(Frame::audio("", 0, data, 8000, 1, m));
    }

    pub fn fail_sends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn rate_limit_sends(&self, n: u32) {
        self.rate_limit_next.store(n, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_texts.lock().clone()
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn flush_sends(&self) -> u32 {
        self.flush_sends.load(Ordering::SeqCst)
    }

    fn check_failures(&self) -> Result<()> {
        if take_failure(&self.rate_limit_next) {
            return Err(Error::rate_limit("mock_tts", "429"));
        }
        if take_failure(&self.fail_next) {
            return Err(Error::Vendor("mock tts send failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamingTts for MockTts {
    fn name(&self) -> &'static str {
        "mock_tts"
    }

    async fn start(&self, _cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.check_failures()?;
        self.sent_texts.lock().push(text.to_string());
        Ok(())
    }

    async fn send_text_with_options(&self, text: &str, flush: bool) -> Result<()> {
        self.check_failures()?;
        if !text.is_empty() {
            self.sent_texts.lock().push(text.to_string());
        }
        if flush {
            self.flush_sends.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn supports_flush_variant(&self) -> bool {
        true
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn try_recv(&self) -> Option<Frame> {
        self.results.lock().pop_front()
    }
}

/// Scripted LLM adapter. `generate` returns the configured response;
/// `stream` tokenizes the configured reply text.
pub struct MockLlm {
    response: Mutex<LlmResponse>,
    fail_next: AtomicU32,
    generate_calls: AtomicU32,
}

impl MockLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(LlmResponse::default()),
            fail_next: AtomicU32::new(0),
            generate_calls: AtomicU32::new(0),
        })
    }

    pub fn with_reply(text: &str) -> Arc<Self> {
        let mock = Self::new();
        mock.set_reply(text);
        mock
    }

    pub fn with_tool_call(name: &str, arguments: serde_json::Value) -> Arc<Self> {
        let mock = Self::new();
        mock.set_response(LlmResponse {
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments,
            }],
            ..Default::default()
        });
        mock
    }

    pub fn failing() -> Arc<Self> {
        let mock = Self::new();
        mock.fail_next.store(u32::MAX, Ordering::SeqCst);
        mock
    }

    pub fn set_reply(&self, text: &str) {
        *self.response.lock() = LlmResponse {
            text: text.to_string(),
            ..Default::default()
        };
    }

    pub fn set_response(&self, response: LlmResponse) {
        *self.response.lock() = response;
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmAdapter for MockLlm {
    fn name(&self) -> &'static str {
        "mock_llm"
    }

    async fn generate(&self, _input: LlmContext) -> Result<LlmResponse> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_next) {
            return Err(Error::Vendor("mock llm unavailable".into()));
        }
        Ok(self.response.lock().clone())
    }

    async fn stream(&self, _input: LlmContext) -> Result<TokenStream> {
        if take_failure(&self.fail_next) {
            return Err(Error::Vendor("mock llm unavailable".into()));
        }
        let text = self.response.lock().text.clone();
        let tokens: Vec<String> = text
            .split_inclusive(' ')
            .map(|t| t.to_string())
            .collect();
        Ok(Box::pin(futures::stream::iter(tokens)))
    }
}
