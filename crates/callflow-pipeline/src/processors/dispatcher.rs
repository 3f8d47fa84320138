//! Tool dispatcher.
//!
//! Consumes `ToolCall` control frames onto a bounded work queue served by a
//! fixed worker pool. Results re-enter the pipeline as `tool_result` system
//! frames through the orchestrator's input channel, which breaks the
//! LLM -> tool -> LLM cycle without a synchronous call back into the LLM.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use callflow_config::ToolsConfig;
use callflow_core::{
    meta, ControlCode, Error, Frame, FrameProcessor, Meta, Result, ToolRegistry,
};

use super::now_pts;

const TASK_QUEUE_CAPACITY: usize = 64;

pub struct ToolDispatcher {
    tasks_tx: mpsc::Sender<Meta>,
}

struct Worker {
    registry: Arc<dyn ToolRegistry>,
    pipeline_tx: mpsc::Sender<Frame>,
    cfg: ToolsConfig,
    stream_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ToolDispatcher {
    /// `pipeline_tx` must be the owning orchestrator's input sender so tool
    /// results travel the same path as externally originated frames.
    pub fn new(
        registry: Arc<dyn ToolRegistry>,
        pipeline_tx: mpsc::Sender<Frame>,
        cfg: ToolsConfig,
    ) -> Self {
        let mut cfg = cfg;
        if cfg.concurrency == 0 {
            cfg.concurrency = 4;
        }
        if cfg.retry_backoff_ms == 0 {
            cfg.retry_backoff_ms = 150;
        }
        let (tasks_tx, tasks_rx) = mpsc::channel::<Meta>(TASK_QUEUE_CAPACITY);
        let worker = Arc::new(Worker {
            registry,
            pipeline_tx,
            cfg: cfg.clone(),
            stream_locks: Mutex::new(HashMap::new()),
        });
        let tasks_rx = Arc::new(tokio::sync::Mutex::new(tasks_rx));
        for _ in 0..cfg.concurrency {
            let worker = worker.clone();
            let tasks_rx = tasks_rx.clone();
            tokio::spawn(async move {
                loop {
                    let task = { tasks_rx.lock().await.recv().await };
                    match task {
                        Some(task) => worker.execute(task).await,
                        None => return,
                    }
                }
            });
        }
        Self { tasks_tx }
    }
}

#[async_trait]
impl FrameProcessor for ToolDispatcher {
    fn name(&self) -> &'static str {
        "tool_dispatcher"
    }

    async fn process(&self, frame: Frame) -> Result<Vec<Frame>> {
        if frame.control_code() != Some(ControlCode::ToolCall) {
            return Ok(vec![frame]);
        }
        let task = frame.meta();
        if self.tasks_tx.try_send(task).is_err() {
            tracing::warn!(
                tool_name = frame.meta_value(meta::TOOL_NAME),
                "tool_dispatcher_queue_full"
            );
        }
        Ok(vec![frame])
    }
}

impl Worker {
    async fn execute(&self, task: Meta) {
        let call_id = task.get(meta::TOOL_CALL_ID).cloned().unwrap_or_default();
        let name = task.get(meta::TOOL_NAME).cloned().unwrap_or_default();
        if call_id.is_empty() || name.is_empty() {
            return;
        }
        let stream_id = task.get(meta::STREAM_ID).cloned().unwrap_or_default();

        let mut args: serde_json::Value = task
            .get(meta::TOOL_ARGS)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));
        if !args.is_object() {
            args = serde_json::json!({});
        }
        if let Some(obj) = args.as_object_mut() {
            obj.entry(meta::IDEMPOTENCY_KEY).or_insert_with(|| {
                serde_json::Value::String(format!("{stream_id}:{call_id}"))
            });
        }

        let outcome = if self.cfg.serialize_by_stream {
            let lock = self.stream_lock(&stream_id);
            let _guard = lock.lock().await;
            self.call_with_retry(&name, &args).await
        } else {
            self.call_with_retry(&name, &args).await
        };

        let (result, status, error) = match outcome {
            Ok(result) => (result, "ok", None),
            Err(Error::ToolTimeout) => ("error".to_string(), "timeout", Some("tool timeout".to_string())),
            Err(err) => ("error".to_string(), "error", Some(err.to_string())),
        };

        let mut m = Meta::new();
        m.insert(meta::TOOL_CALL_ID.to_string(), call_id);
        m.insert(meta::TOOL_NAME.to_string(), name.clone());
        m.insert(meta::TOOL_RESULT.to_string(), result);
        m.insert(meta::TOOL_STATUS.to_string(), status.to_string());
        if let Some(error) = error {
            tracing::warn!(tool_name = %name, status, error = %error, "tool_execution_failed");
            m.insert(meta::TOOL_ERROR.to_string(), error);
        }
        for key in [meta::CALL_SID, meta::TRACE_ID, meta::LANGUAGE] {
            if let Some(v) = task.get(key) {
                if !v.is_empty() {
                    m.insert(key.to_string(), v.clone());
                }
            }
        }
        let frame = Frame::system(&stream_id, now_pts(), "tool_result", m);
        if self.pipeline_tx.try_send(frame).is_err() {
            tracing::warn!(tool_name = %name, "tool_result_dropped_pipeline_full");
        }
    }

    async fn call_with_retry(&self, name: &str, args: &serde_json::Value) -> Result<String> {
        let attempts = self.cfg.retries + 1;
        let mut last_err = Error::Tool("tool error".into());
        for attempt in 0..attempts {
            match self.call_with_timeout(name, args.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) => last_err = err,
            }
            if attempt + 1 < attempts {
                // Linear backoff: base * attempt number.
                let backoff = Duration::from_millis(self.cfg.retry_backoff_ms * (attempt as u64 + 1));
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_err)
    }

    async fn call_with_timeout(&self, name: &str, args: serde_json::Value) -> Result<String> {
        if self.cfg.timeout_ms == 0 {
            return self.registry.handle_tool(name, args).await;
        }
        let deadline = Duration::from_millis(self.cfg.timeout_ms);
        match tokio::time::timeout(deadline, self.registry.handle_tool(name, args)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ToolTimeout),
        }
    }

    fn stream_lock(&self, stream_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        if stream_id.is_empty() {
            return Arc::new(tokio::sync::Mutex::new(()));
        }
        self.stream_locks
            .lock()
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callflow_core::ToolSpec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoRegistry {
        calls: AtomicU32,
        fail_first: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ToolRegistry for EchoRegistry {
        fn tools(&self) -> Vec<ToolSpec> {
            vec![ToolSpec::new("echo", "echoes arguments")]
        }

        async fn handle_tool(&self, _name: &str, args: serde_json::Value) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::Tool("transient".into()));
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(args.to_string())
        }
    }

    fn tool_call_frame(call_id: &str) -> Frame {
        let mut m = Meta::new();
        m.insert(meta::TOOL_CALL_ID.to_string(), call_id.to_string());
        m.insert(meta::TOOL_NAME.to_string(), "echo".to_string());
        m.insert(meta::TOOL_ARGS.to_string(), "{\"a\":1}".to_string());
        m.insert(meta::CALL_SID.to_string(), "CA1".to_string());
        Frame::control("S1", now_pts(), ControlCode::ToolCall, m)
    }

    async fn recv_result(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("tool result timed out")
            .expect("pipeline channel closed")
    }

    #[tokio::test]
    async fn emits_tool_result_into_pipeline() {
        let (tx, mut rx) = mpsc::channel(8);
        let registry = Arc::new(EchoRegistry {
            calls: AtomicU32::new(0),
            fail_first: false,
            delay: Duration::ZERO,
        });
        let d = ToolDispatcher::new(registry, tx, ToolsConfig::default());
        let out = d.process(tool_call_frame("c1")).await.unwrap();
        // The control frame continues downstream.
        assert_eq!(out.len(), 1);

        let result = recv_result(&mut rx).await;
        assert_eq!(result.system_name(), "tool_result");
        assert_eq!(result.meta_value(meta::TOOL_STATUS), "ok");
        assert_eq!(result.meta_value(meta::TOOL_CALL_ID), "c1");
        assert_eq!(result.meta_value(meta::CALL_SID), "CA1");
        // The idempotency key was injected into the arguments.
        assert!(result.meta_value(meta::TOOL_RESULT).contains("S1:c1"));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (tx, mut rx) = mpsc::channel(8);
        let registry = Arc::new(EchoRegistry {
            calls: AtomicU32::new(0),
            fail_first: true,
            delay: Duration::ZERO,
        });
        let cfg = ToolsConfig {
            retries: 1,
            retry_backoff_ms: 10,
            ..Default::default()
        };
        let d = ToolDispatcher::new(registry.clone(), tx, cfg);
        d.process(tool_call_frame("c2")).await.unwrap();
        let result = recv_result(&mut rx).await;
        assert_eq!(result.meta_value(meta::TOOL_STATUS), "ok");
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_is_reported_as_status() {
        let (tx, mut rx) = mpsc::channel(8);
        let registry = Arc::new(EchoRegistry {
            calls: AtomicU32::new(0),
            fail_first: false,
            delay: Duration::from_millis(200),
        });
        let cfg = ToolsConfig {
            timeout_ms: 20,
            retries: 0,
            ..Default::default()
        };
        let d = ToolDispatcher::new(registry, tx, cfg);
        d.process(tool_call_frame("c3")).await.unwrap();
        let result = recv_result(&mut rx).await;
        assert_eq!(result.meta_value(meta::TOOL_STATUS), "timeout");
        assert!(!result.meta_value(meta::TOOL_ERROR).is_empty());
    }

    #[tokio::test]
    async fn non_tool_frames_pass_through() {
        let (tx, _rx) = mpsc::channel(8);
        let registry = Arc::new(EchoRegistry {
            calls: AtomicU32::new(0),
            fail_first: false,
            delay: Duration::ZERO,
        });
        let d = ToolDispatcher::new(registry, tx, ToolsConfig::default());
        let out = d
            .process(Frame::text("S1", 1, "halo", Meta::new()))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
    }
}
