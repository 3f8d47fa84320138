//! Telephony transport contract.
//!
//! Transports live outside this workspace; the pipeline only depends on
//! these traits. Inbound conventions: a `call_start` System frame carries
//! call_sid, stream_id and trace_id (optionally from_number); audio frames
//! carry stream_id; DTMF arrives as a Control frame with `dtmf_digit`;
//! `call_end` may carry a normalized `call_end_reason`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::frame::Frame;

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts the transport and returns the inbound frame stream. The
    /// transport must stop producing when the token is cancelled.
    async fn start(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<Frame>>;

    async fn stop(&self) -> Result<()>;

    /// Outbound path. Audio frames are played to the caller; `Flush`,
    /// `Cancel` and `StartInterruption` controls clear buffered outbound
    /// audio; `Fallback` plays a short vendor-independent filler (optional
    /// capability, transports may ignore it).
    async fn send(&self, frame: Frame) -> Result<()>;
}

/// Optional capability: sending DTMF digits during an active call.
#[async_trait]
pub trait DtmfSender: Send + Sync {
    async fn send_dtmf(&self, call_sid: &str, digits: &str) -> Result<()>;
}

/// Optional capability: initiating outbound calls.
#[async_trait]
pub trait OutboundDialer: Send + Sync {
    async fn dial(&self, to: &str, from: &str, url: &str) -> Result<String>;
}

/// Optional capability: readiness metadata for informational logging.
pub trait ReadyReporter: Send + Sync {
    fn ready_fields(&self) -> HashMap<String, String>;
}
