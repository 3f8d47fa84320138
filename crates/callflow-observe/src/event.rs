//! Observer events and the sink contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// One recorded pipeline event (frame_in, stage_latency_us, stt_final, ...).
#[derive(Debug, Clone)]
pub struct ObserverEvent {
    pub name: String,
    pub time: SystemTime,
    pub value: f64,
    pub tags: HashMap<String, String>,
    pub fields: HashMap<String, serde_json::Value>,
}

impl ObserverEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time: SystemTime::now(),
            value: 0.0,
            tags: HashMap::new(),
            fields: HashMap::new(),
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn tag(&self, key: &str) -> &str {
        self.tags.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Sink for observer events. Implementations must never block for long.
pub trait Observer: Send + Sync {
    fn record(&self, event: ObserverEvent);
}

/// Discards everything.
#[derive(Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record(&self, _event: ObserverEvent) {}
}

/// Fans an event out to every configured sink.
pub struct MultiObserver {
    sinks: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new(sinks: Vec<Arc<dyn Observer>>) -> Self {
        Self { sinks }
    }
}

impl Observer for MultiObserver {
    fn record(&self, event: ObserverEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}
