//! Rate-limited sampling decorator for high-volume sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::{Observer, ObserverEvent};

/// Records approximately `rate` of the events it sees (every Nth event).
pub struct SamplingObserver {
    inner: Arc<dyn Observer>,
    sample_every: u64,
    counter: AtomicU64,
}

impl SamplingObserver {
    pub fn new(inner: Arc<dyn Observer>, rate: f64) -> Self {
        let rate = rate.clamp(0.0, 1.0);
        let sample_every = if rate == 0.0 {
            0
        } else {
            (1.0 / rate).round().max(1.0) as u64
        };
        Self {
            inner,
            sample_every,
            counter: AtomicU64::new(0),
        }
    }
}

impl Observer for SamplingObserver {
    fn record(&self, event: ObserverEvent) {
        match self.sample_every {
            0 => {}
            1 => self.inner.record(event),
            every => {
                let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n % every == 0 {
                    self.inner.record(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObserver;

    #[test]
    fn samples_every_nth_event() {
        let sink = Arc::new(MemoryObserver::new());
        let obs = SamplingObserver::new(sink.clone(), 0.25);
        for _ in 0..100 {
            obs.record(ObserverEvent::new("spam"));
        }
        assert_eq!(sink.events().len(), 25);
    }

    #[test]
    fn zero_rate_drops_everything() {
        let sink = Arc::new(MemoryObserver::new());
        let obs = SamplingObserver::new(sink.clone(), 0.0);
        obs.record(ObserverEvent::new("spam"));
        assert!(sink.events().is_empty());
    }
}
