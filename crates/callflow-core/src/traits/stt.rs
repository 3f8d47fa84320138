//! Streaming speech-to-text vendor contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::frame::Frame;

/// One vendor STT session bound to a single media stream.
///
/// Result frames are Text frames carrying `is_final`, or Control `Flush`
/// frames with `reason` in {speech_started, utterance_end, speech_final,
/// question} for VAD events. Sessions buffer results internally; the
/// processor drains them non-blockingly via [`try_recv`].
///
/// [`try_recv`]: StreamingStt::try_recv
#[async_trait]
pub trait StreamingStt: Send + Sync {
    /// Adapter name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Send one audio frame. Borrowed so the caller can replay the same
    /// frame to a fresh session after a reconnect.
    async fn send_audio(&self, frame: &Frame) -> Result<()>;

    /// Next buffered result frame, if any. Never blocks.
    fn try_recv(&self) -> Option<Frame>;
}
