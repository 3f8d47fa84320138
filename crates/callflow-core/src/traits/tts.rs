//! Streaming text-to-speech vendor contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::frame::Frame;

/// One vendor TTS session bound to a single media stream.
#[async_trait]
pub trait StreamingTts: Send + Sync {
    /// Adapter name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn send_text(&self, text: &str) -> Result<()>;

    /// Send with an explicit end-of-utterance flush. The default emulates
    /// the variant with `send_text` + `flush`; vendors with a native flush
    /// flag override this and report it via [`supports_flush_variant`].
    ///
    /// [`supports_flush_variant`]: StreamingTts::supports_flush_variant
    async fn send_text_with_options(&self, text: &str, flush: bool) -> Result<()> {
        if !text.is_empty() {
            self.send_text(text).await?;
        }
        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    fn supports_flush_variant(&self) -> bool {
        false
    }

    /// Stops current synthesis and clears vendor-side buffers.
    async fn flush(&self) -> Result<()>;

    /// Next buffered audio/control frame, if any. Never blocks.
    fn try_recv(&self) -> Option<Frame>;
}
