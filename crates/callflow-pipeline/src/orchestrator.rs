//! The per-call orchestrator.
//!
//! Runs a chain of frame processors in one of two modes:
//!
//! - **Synchronous**: a feeder task routes arriving frames onto the
//!   priority queue; a single driver task pops, runs the full chain on one
//!   frame, and emits the outputs.
//! - **Staged asynchronous**: one task per processor with bounded channels
//!   between stages; a feeder/popper pair shuttles frames from the queue
//!   into stage 0 and a drainer pushes the last stage's output out.
//!
//! Both modes share the same observability hooks (`frame_in`, `frame_out`,
//! `frame_drop`, `stage_latency_us`) and the stale-audio policy: audio with
//! a wall-clock PTS lagging more than 500 ms is dropped before any
//! processor sees it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use callflow_config::{Backpressure, PipelineConfig};
use callflow_core::{release_frame, Frame, FrameKind, FrameProcessor, Result};
use callflow_observe::{Observer, ObserverEvent};

use crate::priority::{PriorityQueue, QueueStats};
use callflow_core::meta;

const MAX_AUDIO_LAG: Duration = Duration::from_millis(500);
/// PTS below this is treated as relative, not wall-clock.
const WALL_CLOCK_PTS_FLOOR: i64 = 1_000_000_000_000;

type Sink = Arc<dyn Fn(&Frame) + Send + Sync>;

pub struct Orchestrator {
    cfg: PipelineConfig,
    queue: Arc<PriorityQueue>,
    cancel: CancellationToken,
    in_tx: mpsc::Sender<Frame>,
    in_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    out_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    out_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    processors: Mutex<Vec<Arc<dyn FrameProcessor>>>,
    sink: Mutex<Option<Sink>>,
    observer: Mutex<Option<Arc<dyn Observer>>>,
    started: AtomicBool,
}

struct Shared {
    cfg: PipelineConfig,
    queue: Arc<PriorityQueue>,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<Frame>,
    sink: Option<Sink>,
    observer: Option<Arc<dyn Observer>>,
}

impl Orchestrator {
    pub fn new(cfg: PipelineConfig, cancel: CancellationToken) -> Arc<Self> {
        let capacity = cfg.high_capacity + cfg.low_capacity;
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let queue = Arc::new(PriorityQueue::new(
            cfg.high_capacity,
            cfg.low_capacity,
            cfg.fairness_ratio,
        ));
        Arc::new(Self {
            cfg,
            queue,
            cancel,
            in_tx,
            in_rx: Mutex::new(Some(in_rx)),
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: Mutex::new(Some(out_rx)),
            processors: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            observer: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn add_processor(&self, processor: Arc<dyn FrameProcessor>) {
        self.processors.lock().push(processor);
    }

    /// Terminal consumer for output frames. When set, the out channel is
    /// not used and frames are released right after the sink observes them.
    pub fn set_sink(&self, sink: impl Fn(&Frame) + Send + Sync + 'static) {
        *self.sink.lock() = Some(Arc::new(sink));
    }

    pub fn set_observer(&self, observer: Arc<dyn Observer>) {
        *self.observer.lock() = Some(observer);
    }

    /// Sender feeding this pipeline. Cloneable; used by the transport glue
    /// and by the tool dispatcher to re-enter tool results.
    pub fn input(&self) -> mpsc::Sender<Frame> {
        self.in_tx.clone()
    }

    /// Output receiver, available once and only when no sink is set.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Frame>> {
        self.out_rx.lock().take()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let processors = self.processors.lock().clone();
        if processors.is_empty() {
            tracing::warn!("orchestrator starting with an empty processor chain");
        } else {
            let order: Vec<&str> = processors.iter().map(|p| p.name()).collect();
            tracing::info!(order = order.join(" -> "), "pipeline");
        }
        let out_tx = self
            .out_tx
            .lock()
            .clone()
            .ok_or(callflow_core::Error::Channel("orchestrator out"))?;
        let in_rx = self
            .in_rx
            .lock()
            .take()
            .ok_or(callflow_core::Error::Channel("orchestrator in"))?;
        let shared = Arc::new(Shared {
            cfg: self.cfg.clone(),
            queue: self.queue.clone(),
            cancel: self.cancel.clone(),
            out_tx,
            sink: self.sink.lock().clone(),
            observer: self.observer.lock().clone(),
        });

        spawn_feeder(shared.clone(), in_rx);
        if self.cfg.r#async {
            start_staged(shared, processors);
        } else {
            start_sync(shared, processors);
        }
        Ok(())
    }

    /// Cancels the pipeline. Stage tasks exit and the out channel closes;
    /// in-flight frames may be dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.out_tx.lock().take();
    }
}

fn spawn_feeder(shared: Arc<Shared>, mut in_rx: mpsc::Receiver<Frame>) {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                frame = in_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            record_frame(&shared, "frame_in", &frame);
            let rejected = match frame.kind() {
                FrameKind::Control | FrameKind::System => shared.queue.try_push_high(frame),
                _ => shared.queue.try_push_low(frame),
            };
            if let Err(frame) = rejected {
                record_frame(&shared, "frame_drop", &frame);
                release_frame(frame);
            }
        }
    });
}

fn start_sync(shared: Arc<Shared>, processors: Vec<Arc<dyn FrameProcessor>>) {
    tokio::spawn(async move {
        while let Some(frame) = shared.queue.pop(&shared.cancel).await {
            if drop_for_lag(&frame) {
                record_frame(&shared, "frame_drop", &frame);
                release_frame(frame);
                continue;
            }
            let mut frames = vec![frame];
            for processor in &processors {
                let mut next = Vec::new();
                for current in frames {
                    let stream_id = current.stream_id().to_string();
                    let started = Instant::now();
                    match processor.process(current).await {
                        Ok(outputs) => {
                            record_stage(&shared, processor.name(), &stream_id, started);
                            next.extend(outputs);
                        }
                        Err(err) => {
                            tracing::warn!(
                                processor = processor.name(),
                                reason_code = %err.reason(),
                                error = %err,
                                "processor error"
                            );
                        }
                    }
                }
                frames = next;
                if frames.is_empty() {
                    break;
                }
            }
            for frame in frames {
                record_frame(&shared, "frame_out", &frame);
                emit(&shared, frame).await;
            }
        }
    });
}

fn start_staged(shared: Arc<Shared>, processors: Vec<Arc<dyn FrameProcessor>>) {
    let stages = processors.len();
    let mut senders = Vec::with_capacity(stages + 1);
    let mut receivers = Vec::with_capacity(stages + 1);
    for _ in 0..=stages {
        let (tx, rx) = mpsc::channel::<Frame>(shared.cfg.stage_buffer);
        senders.push(tx);
        receivers.push(rx);
    }
    // receivers[i] feeds processor i; senders[i + 1] is its output.
    let mut receivers = receivers.into_iter();
    let stage0_tx = senders[0].clone();

    for (i, processor) in processors.into_iter().enumerate() {
        let mut rx = receivers.next().expect("stage receiver");
        let tx = senders[i + 1].clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => return,
                    },
                };
                let stream_id = frame.stream_id().to_string();
                let started = Instant::now();
                match processor.process(frame).await {
                    Ok(outputs) => {
                        record_stage(&shared, processor.name(), &stream_id, started);
                        for output in outputs {
                            push_stage(&shared, &tx, output).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            processor = processor.name(),
                            reason_code = %err.reason(),
                            error = %err,
                            "processor error"
                        );
                    }
                }
            }
        });
    }

    // Popper: priority queue -> stage 0.
    {
        let shared = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = shared.queue.pop(&shared.cancel).await {
                push_stage(&shared, &stage0_tx, frame).await;
            }
        });
    }

    // Drainer: last stage -> sink / out channel.
    let mut final_rx = receivers.next().expect("final stage receiver");
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                frame = final_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            record_frame(&shared, "frame_out", &frame);
            emit(&shared, frame).await;
        }
    });
}

async fn emit(shared: &Shared, frame: Frame) {
    if let Some(sink) = &shared.sink {
        sink(&frame);
        release_frame(frame);
        return;
    }
    push_stage(shared, &shared.out_tx, frame).await;
}

/// Forwards to a bounded channel honoring the stale-audio policy and the
/// configured backpressure mode.
async fn push_stage(shared: &Shared, tx: &mpsc::Sender<Frame>, frame: Frame) {
    if drop_for_lag(&frame) {
        record_frame(shared, "frame_drop", &frame);
        release_frame(frame);
        return;
    }
    match shared.cfg.backpressure {
        Backpressure::Wait => {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    // frame is owned by the `tx.send(frame)` future below, which
                    // tokio::select! constructs eagerly; dropping that future here
                    // releases the frame (and its pooled buffer) the same way
                    // release_frame() would.
                }
                sent = tx.send(frame) => {
                    if sent.is_err() {
                        // Receiver gone during shutdown; frame released on drop.
                    }
                }
            }
        }
        Backpressure::Drop => {
            if let Err(err) = tx.try_send(frame) {
                let frame = match err {
                    mpsc::error::TrySendError::Full(frame) => frame,
                    mpsc::error::TrySendError::Closed(frame) => frame,
                };
                record_frame(shared, "frame_drop", &frame);
                release_frame(frame);
            }
        }
    }
}

fn drop_for_lag(frame: &Frame) -> bool {
    if frame.kind() != FrameKind::Audio {
        return false;
    }
    let pts = frame.pts();
    if pts < WALL_CLOCK_PTS_FLOOR {
        return false;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    now.saturating_sub(pts) > MAX_AUDIO_LAG.as_nanos() as i64
}

fn record_frame(shared: &Shared, name: &str, frame: &Frame) {
    let Some(observer) = &shared.observer else {
        return;
    };
    let mut event = ObserverEvent::new(name)
        .with_tag(meta::STREAM_ID, frame.meta_value(meta::STREAM_ID))
        .with_tag(meta::TRACE_ID, frame.meta_value(meta::TRACE_ID))
        .with_tag(meta::AGENT, frame.meta_value(meta::AGENT))
        .with_tag("kind", frame.kind().as_str())
        .with_tag("source", frame.meta_value(meta::SOURCE));
    if let Some(code) = frame.control_code() {
        event = event
            .with_tag("control_code", code.as_str())
            .with_tag("control_reason", frame.meta_value(meta::REASON));
    }
    let system_name = frame.system_name();
    if !system_name.is_empty() {
        event = event.with_tag("system_name", system_name);
    }
    observer.record(event);
}

fn record_stage(shared: &Shared, processor: &str, stream_id: &str, started: Instant) {
    let Some(observer) = &shared.observer else {
        return;
    };
    observer.record(
        ObserverEvent::new("stage_latency_us")
            .with_value(started.elapsed().as_micros() as f64)
            .with_tag("processor", processor)
            .with_tag(meta::STREAM_ID, stream_id),
    );
}
