//! Two-lane priority queue with weighted fairness.
//!
//! Control and system frames ride the high lane; media rides low. Push is
//! non-blocking: a full lane rejects the frame and the caller drops it.
//! Pop prefers the high lane but yields one low-lane pop after
//! `fairness_ratio` consecutive high pops, so media is never starved. When
//! both lanes are empty pop sleeps briefly and retries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use callflow_core::Frame;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Push/pop counters, readable without locking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub high_push: u64,
    pub low_push: u64,
    pub high_pop: u64,
    pub low_pop: u64,
}

pub struct PriorityQueue {
    high: Mutex<VecDeque<Frame>>,
    low: Mutex<VecDeque<Frame>>,
    high_capacity: usize,
    low_capacity: usize,
    fairness: u64,
    high_streak: AtomicU64,
    high_push: AtomicU64,
    low_push: AtomicU64,
    high_pop: AtomicU64,
    low_pop: AtomicU64,
}

impl PriorityQueue {
    pub fn new(high_capacity: usize, low_capacity: usize, fairness: u32) -> Self {
        let fairness = if fairness == 0 { 3 } else { fairness };
        Self {
            high: Mutex::new(VecDeque::with_capacity(high_capacity)),
            low: Mutex::new(VecDeque::with_capacity(low_capacity)),
            high_capacity,
            low_capacity,
            fairness: fairness as u64,
            high_streak: AtomicU64::new(0),
            high_push: AtomicU64::new(0),
            low_push: AtomicU64::new(0),
            high_pop: AtomicU64::new(0),
            low_pop: AtomicU64::new(0),
        }
    }

    /// Non-blocking push; the frame comes back on a full lane so the caller
    /// can release it.
    pub fn try_push_high(&self, frame: Frame) -> Result<(), Frame> {
        let mut lane = self.high.lock();
        if lane.len() >= self.high_capacity {
            return Err(frame);
        }
        lane.push_back(frame);
        self.high_push.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn try_push_low(&self, frame: Frame) -> Result<(), Frame> {
        let mut lane = self.low.lock();
        if lane.len() >= self.low_capacity {
            return Err(frame);
        }
        lane.push_back(frame);
        self.low_push.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Next frame honoring the fairness ratio. Returns `None` only when the
    /// token is cancelled.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Frame> {
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }

    /// Single scheduling decision; `None` when both lanes are empty.
    pub fn try_pop(&self) -> Option<Frame> {
        // After `fairness` consecutive high pops, serve low first.
        if self.high_streak.load(Ordering::Relaxed) >= self.fairness {
            if let Some(frame) = self.low.lock().pop_front() {
                self.low_pop.fetch_add(1, Ordering::Relaxed);
                self.high_streak.store(0, Ordering::Relaxed);
                return Some(frame);
            }
        }
        if let Some(frame) = self.high.lock().pop_front() {
            self.high_pop.fetch_add(1, Ordering::Relaxed);
            self.high_streak.fetch_add(1, Ordering::Relaxed);
            return Some(frame);
        }
        if let Some(frame) = self.low.lock().pop_front() {
            self.low_pop.fetch_add(1, Ordering::Relaxed);
            self.high_streak.store(0, Ordering::Relaxed);
            return Some(frame);
        }
        None
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            high_push: self.high_push.load(Ordering::Relaxed),
            low_push: self.low_push.load(Ordering::Relaxed),
            high_pop: self.high_pop.load(Ordering::Relaxed),
            low_pop: self.low_pop.load(Ordering::Relaxed),
        }
    }
}
