//! The frame processor contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::Frame;

/// A single pipeline stage.
///
/// Semantics of the returned frame list:
/// - empty: the input was absorbed (e.g. suppressed)
/// - one or more: consumed by later stages in order
/// - `Err`: aborts this frame for this stage; the orchestrator releases the
///   frame and the chain continues with the next input
///
/// Processors are stateful. The staged-async orchestrator serializes calls
/// per stage, but some processors are also addressed by external callers,
/// so implementations guard their state internally.
#[async_trait]
pub trait FrameProcessor: Send + Sync {
    /// Stable name for logs and stage-latency metrics.
    fn name(&self) -> &'static str;

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>>;
}
