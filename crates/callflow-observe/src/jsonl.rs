//! JSON-lines file sink.

use std::io::Write;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::event::{Observer, ObserverEvent};

#[derive(Serialize)]
struct JsonlRecord<'a> {
    name: &'a str,
    time: DateTime<Utc>,
    value: f64,
    tags: &'a std::collections::HashMap<String, String>,
    fields: &'a std::collections::HashMap<String, serde_json::Value>,
}

/// Writes one JSON object per event to the given writer.
pub struct JsonlObserver<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonlObserver<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> Observer for JsonlObserver<W> {
    fn record(&self, event: ObserverEvent) {
        let record = JsonlRecord {
            name: &event.name,
            time: event.time.into(),
            value: event.value,
            tags: &event.tags,
            fields: &event.fields,
        };
        let mut out = self.out.lock();
        if let Ok(line) = serde_json::to_vec(&record) {
            let _ = out.write_all(&line);
            let _ = out.write_all(b"\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_event() {
        let buf: Vec<u8> = Vec::new();
        let obs = JsonlObserver::new(buf);
        obs.record(ObserverEvent::new("frame_in").with_tag("stream_id", "s1"));
        obs.record(ObserverEvent::new("frame_out"));
        let out = obs.out.into_inner();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["name"], "frame_in");
        assert_eq!(first["tags"]["stream_id"], "s1");
    }
}
