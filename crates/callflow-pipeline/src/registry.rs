//! Process-wide session registry.
//!
//! One pipeline per call, keyed by call_sid. A `call_start` for a known
//! call_sid with a new stream_id supersedes the old session: the old
//! pipeline is stopped before the new one accepts frames, so at any instant
//! at most one session is active per call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_core::Result;

use crate::orchestrator::Orchestrator;

pub struct Session {
    pub call_sid: String,
    pub stream_id: String,
    pub trace_id: String,
    pub orchestrator: Arc<Orchestrator>,
    pub cancel: CancellationToken,
    pub created: Instant,
}

/// Builds an orchestrator for a new call. The token is a child of the
/// registry's root token, so registry shutdown cascades into every call.
pub type SessionFactory =
    Arc<dyn Fn(CancellationToken, &str, &str, &str) -> Result<Arc<Orchestrator>> + Send + Sync>;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    factory: SessionFactory,
    root: CancellationToken,
    draining: AtomicBool,
}

impl SessionRegistry {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            root: CancellationToken::new(),
            draining: AtomicBool::new(false),
        }
    }

    /// Returns the session for `call_sid`, creating and starting one when
    /// absent. The boolean is true when this call created the session.
    ///
    /// A live session with a different stream_id is superseded: stopped and
    /// replaced before the new session is returned. Empty call_sids and
    /// draining registries yield `None`.
    pub fn get_or_create(
        &self,
        call_sid: &str,
        stream_id: &str,
        trace_id: &str,
    ) -> Result<Option<(Arc<Session>, bool)>> {
        if call_sid.is_empty() || self.draining() {
            return Ok(None);
        }
        if let Some(existing) = self.lookup_or_supersede(call_sid, stream_id) {
            return Ok(Some((existing, false)));
        }

        let cancel = self.root.child_token();
        let orchestrator = (self.factory)(cancel.clone(), call_sid, stream_id, trace_id)?;
        if let Err(err) = orchestrator.start() {
            cancel.cancel();
            return Err(err);
        }
        let session = Arc::new(Session {
            call_sid: call_sid.to_string(),
            stream_id: stream_id.to_string(),
            trace_id: trace_id.to_string(),
            orchestrator,
            cancel,
            created: Instant::now(),
        });

        let mut sessions = self.sessions.lock();
        if let Some(winner) = sessions.get(call_sid) {
            // A concurrent creator won the race; discard ours.
            let winner = winner.clone();
            drop(sessions);
            session.cancel.cancel();
            session.orchestrator.stop();
            return Ok(Some((winner, false)));
        }
        sessions.insert(call_sid.to_string(), session.clone());
        Ok(Some((session, true)))
    }

    fn lookup_or_supersede(&self, call_sid: &str, stream_id: &str) -> Option<Arc<Session>> {
        let existing = self.sessions.lock().get(call_sid).cloned()?;
        if stream_id.is_empty() || existing.stream_id == stream_id {
            return Some(existing);
        }
        // Reconnect with a fresh stream: the old session must stop before
        // the replacement accepts frames.
        tracing::info!(
            call_sid,
            old_stream = %existing.stream_id,
            new_stream = stream_id,
            "superseding session"
        );
        self.remove(call_sid);
        None
    }

    pub fn get(&self, call_sid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(call_sid).cloned()
    }

    pub fn remove(&self, call_sid: &str) {
        if let Some(session) = self.sessions.lock().remove(call_sid) {
            session.cancel.cancel();
            session.orchestrator.stop();
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.cancel.cancel();
            session.orchestrator.stop();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// While draining, new sessions are refused.
    pub fn set_draining(&self, v: bool) {
        self.draining.store(v, Ordering::SeqCst);
    }

    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Polls until the registry is empty; false when cancelled first.
    pub async fn wait_for_empty(&self, cancel: &CancellationToken, interval: Duration) -> bool {
        let interval = if interval.is_zero() {
            Duration::from_millis(200)
        } else {
            interval
        };
        loop {
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
