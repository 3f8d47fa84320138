//! Per-call streaming pipeline for the callflow voice-agent runtime.
//!
//! One [`Orchestrator`] exists per call, driving a chain of
//! [`FrameProcessor`]s either synchronously or staged-async. The
//! process-wide [`SessionRegistry`] owns the set of live pipelines keyed by
//! call id.
//!
//! [`FrameProcessor`]: callflow_core::FrameProcessor

pub mod aggregator;
pub mod orchestrator;
pub mod priority;
pub mod processors;
pub mod registry;
pub mod turn;

#[cfg(test)]
mod e2e;
#[cfg(test)]
pub(crate) mod testutil;

pub use aggregator::{AggregatorConfig, TextAggregator};
pub use orchestrator::Orchestrator;
pub use priority::{PriorityQueue, QueueStats};
pub use registry::{Session, SessionRegistry};
