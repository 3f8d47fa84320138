//! Observability for the callflow runtime.
//!
//! A single async observer fronts a fan-out to zero or more sinks. The
//! async front is bounded and lossy: on overflow it counts the drop and
//! moves on, never blocking the pipeline.

pub mod async_observer;
pub mod cost;
pub mod event;
pub mod jsonl;
pub mod latency;
pub mod logger;
pub mod memory;
pub mod retention;
pub mod sampling;
pub mod timeline;

pub use async_observer::AsyncObserver;
pub use cost::CostObserver;
pub use event::{MultiObserver, NoopObserver, Observer, ObserverEvent};
pub use jsonl::JsonlObserver;
pub use latency::LatencyObserver;
pub use logger::LoggerObserver;
pub use memory::MemoryObserver;
pub use retention::purge_artifacts;
pub use sampling::SamplingObserver;
pub use timeline::TimelineObserver;
