//! Non-blocking async front for observer sinks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::event::{Observer, ObserverEvent};

/// Buffers events on a bounded channel drained by a background task.
///
/// Observability is non-critical: when the buffer is full the event is
/// dropped and counted. Size the buffer up at construction if a deployment
/// needs lossless metrics.
pub struct AsyncObserver {
    tx: mpsc::Sender<ObserverEvent>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl AsyncObserver {
    pub fn new(inner: Arc<dyn Observer>, buffer: usize) -> Arc<Self> {
        let buffer = if buffer == 0 { 256 } else { buffer };
        let (tx, mut rx) = mpsc::channel::<ObserverEvent>(buffer);
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                inner.record(ev);
            }
        });
        Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops accepting events; the drain task exits once the buffer empties.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Observer for AsyncObserver {
    fn record(&self, event: ObserverEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObserver;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_events_asynchronously() {
        let sink = Arc::new(MemoryObserver::new());
        let obs = AsyncObserver::new(sink.clone(), 16);
        obs.record(ObserverEvent::new("frame_in"));
        obs.record(ObserverEvent::new("frame_out"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.events().len(), 2);
        assert_eq!(obs.dropped(), 0);
    }

    #[tokio::test]
    async fn overflow_increments_dropped_counter() {
        // A sink that parks the drain task so the buffer can fill up.
        struct Slow;
        impl Observer for Slow {
            fn record(&self, _ev: ObserverEvent) {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        let obs = AsyncObserver::new(Arc::new(Slow), 1);
        for _ in 0..50 {
            obs.record(ObserverEvent::new("spam"));
        }
        assert!(obs.dropped() > 0);
    }

    #[tokio::test]
    async fn close_stops_accepting() {
        let sink = Arc::new(MemoryObserver::new());
        let obs = AsyncObserver::new(sink.clone(), 16);
        obs.close();
        obs.record(ObserverEvent::new("late"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sink.events().is_empty());
    }
}
