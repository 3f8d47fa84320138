//! Per-trace timeline files.
//!
//! Appends one JSON line per event to `<trace_id>.timeline.jsonl` in the
//! artifacts directory, giving a replayable record of a single call.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::event::{Observer, ObserverEvent};

#[derive(Serialize)]
struct TimelineLine<'a> {
    time: DateTime<Utc>,
    name: &'a str,
    value: f64,
    tags: &'a HashMap<String, String>,
}

pub struct TimelineObserver {
    dir: PathBuf,
    files: Mutex<HashMap<String, std::fs::File>>,
}

impl TimelineObserver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn file_for(&self, trace_id: &str) -> Option<std::fs::File> {
        let mut files = self.files.lock();
        if let Some(f) = files.get(trace_id) {
            return f.try_clone().ok();
        }
        std::fs::create_dir_all(&self.dir).ok()?;
        let path = self
            .dir
            .join(format!("{}.timeline.jsonl", sanitize(trace_id)));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()?;
        let clone = file.try_clone().ok();
        files.insert(trace_id.to_string(), file);
        clone
    }
}

impl Observer for TimelineObserver {
    fn record(&self, event: ObserverEvent) {
        if self.dir.as_os_str().is_empty() {
            return;
        }
        let trace_id = event.tag("trace_id");
        if trace_id.is_empty() {
            return;
        }
        let Some(mut file) = self.file_for(trace_id) else {
            return;
        };
        let line = TimelineLine {
            time: event.time.into(),
            name: &event.name,
            value: event.value,
            tags: &event.tags,
        };
        if let Ok(body) = serde_json::to_vec(&line) {
            let _ = file.write_all(&body);
            let _ = file.write_all(b"\n");
        }
        // Forget the handle once the call ends so long-running processes
        // do not accumulate open files.
        if event.name == "frame_in" && event.tag("system_name") == "call_end" {
            self.files.lock().remove(trace_id);
        }
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_lines_per_trace() {
        let dir = tempfile::tempdir().unwrap();
        let obs = TimelineObserver::new(dir.path());
        obs.record(ObserverEvent::new("frame_in").with_tag("trace_id", "tr1"));
        obs.record(ObserverEvent::new("frame_out").with_tag("trace_id", "tr1"));
        obs.record(ObserverEvent::new("frame_in").with_tag("trace_id", "tr2"));
        let body = std::fs::read_to_string(dir.path().join("tr1.timeline.jsonl")).unwrap();
        assert_eq!(body.lines().count(), 2);
        let body2 = std::fs::read_to_string(dir.path().join("tr2.timeline.jsonl")).unwrap();
        assert_eq!(body2.lines().count(), 1);
    }

    #[test]
    fn untraced_events_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let obs = TimelineObserver::new(dir.path());
        obs.record(ObserverEvent::new("frame_in"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
