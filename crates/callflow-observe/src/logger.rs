//! Sink that forwards events to `tracing` at debug level.

use crate::event::{Observer, ObserverEvent};

#[derive(Default, Clone, Copy)]
pub struct LoggerObserver;

impl LoggerObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LoggerObserver {
    fn record(&self, event: ObserverEvent) {
        tracing::debug!(
            name = %event.name,
            value = event.value,
            tags = ?event.tags,
            fields = ?event.fields,
            "metrics"
        );
    }
}
