//! In-memory sink, primarily for tests and diagnostics.

use parking_lot::Mutex;

use crate::event::{Observer, ObserverEvent};

#[derive(Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().clone()
    }

    /// Names of recorded events, in order.
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.name.clone()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl Observer for MemoryObserver {
    fn record(&self, event: ObserverEvent) {
        self.events.lock().push(event);
    }
}
