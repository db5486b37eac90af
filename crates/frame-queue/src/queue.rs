//! Drop-Oldest Frame Queue Implementation

use crate::QueueError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default queue depth (a single slot: only the newest frame matters)
pub const DEFAULT_CAPACITY: usize = 1;

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame stored without displacing anything
    Stored,
    /// Queue was full, the oldest frame was discarded to make room
    DisplacedOldest,
}

/// Point-in-time queue counters
///
/// `pushed == popped + dropped + cleared + queued` holds for every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames accepted by `push`
    pub pushed: usize,
    /// Frames handed out by `pop_newest*`
    pub popped: usize,
    /// Frames discarded by the drop-oldest / keep-newest policy
    pub dropped: usize,
    /// Frames discarded by `clear`
    pub cleared: usize,
    /// Frames currently waiting
    pub queued: usize,
}

/// Bounded, never-blocking-on-push frame queue
///
/// The producer is usually a driver-owned callback thread and the consumer an
/// acquisition loop. Every frame displaced by either policy is logged once.
pub struct FrameQueue<T> {
    /// Label used in log messages (usually the camera id)
    label: String,
    /// Buffered frames, oldest at the front
    slots: Mutex<VecDeque<T>>,
    /// Maximum number of buffered frames
    capacity: usize,
    /// Signalled whenever a frame is pushed
    available: Condvar,
    pushed: AtomicUsize,
    popped: AtomicUsize,
    dropped: AtomicUsize,
    cleared: AtomicUsize,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` frames
    pub fn new(label: impl Into<String>, capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self::build(label.into(), capacity))
    }

    /// Create a queue with the default single slot
    pub fn single_slot(label: impl Into<String>) -> Self {
        Self::build(label.into(), DEFAULT_CAPACITY)
    }

    fn build(label: String, capacity: usize) -> Self {
        Self {
            label,
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Condvar::new(),
            pushed: AtomicUsize::new(0),
            popped: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            cleared: AtomicUsize::new(0),
        }
    }

    /// Push a frame, discarding the oldest one if the queue is full.
    ///
    /// Never blocks beyond the O(1) internal critical section.
    pub fn push(&self, frame: T) -> PushOutcome {
        let displaced = {
            let mut slots = self.slots.lock();
            let displaced = if slots.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                slots.pop_front()
            } else {
                None
            };
            slots.push_back(frame);
            self.pushed.fetch_add(1, Ordering::Relaxed);
            displaced
        };
        self.available.notify_one();

        match displaced {
            Some(_) => {
                warn!("Queue {} is full, dropped oldest frame", self.label);
                PushOutcome::DisplacedOldest
            }
            None => PushOutcome::Stored,
        }
    }

    /// Take the newest frame without waiting.
    ///
    /// Older frames still queued are discarded, one warning each.
    pub fn pop_newest(&self) -> Option<T> {
        let (frame, discarded) = {
            let mut slots = self.slots.lock();
            self.take_newest(&mut slots)
        };
        self.warn_discarded(discarded);
        frame
    }

    /// Take the newest frame, waiting up to `timeout` for one to arrive
    pub fn pop_newest_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        let (frame, discarded) = {
            let mut slots = self.slots.lock();
            while slots.is_empty() {
                if self.available.wait_until(&mut slots, deadline).timed_out() {
                    break;
                }
            }
            self.take_newest(&mut slots)
        };
        self.warn_discarded(discarded);
        frame
    }

    // Caller holds the slot lock.
    fn take_newest(&self, slots: &mut VecDeque<T>) -> (Option<T>, usize) {
        let newest = slots.pop_back();
        let discarded = slots.len();
        slots.clear();

        if newest.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        self.dropped.fetch_add(discarded, Ordering::Relaxed);
        (newest, discarded)
    }

    fn warn_discarded(&self, discarded: usize) {
        for _ in 0..discarded {
            warn!("Queue {} consumer is delayed, discarded a stale frame", self.label);
        }
    }

    /// Discard every queued frame (e.g. when streaming stops)
    pub fn clear(&self) -> usize {
        let count = {
            let mut slots = self.slots.lock();
            let count = slots.len();
            slots.clear();
            self.cleared.fetch_add(count, Ordering::Relaxed);
            count
        };

        if count > 0 {
            debug!("Queue {} cleared {} frames", self.label, count);
        }
        count
    }

    /// Number of frames currently queued
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if the next push will displace a frame
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Maximum number of queued frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Label used in log messages
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Total frames discarded by the drop policy
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        // Hold the slot lock so the snapshot is consistent with `queued`.
        let slots = self.slots.lock();
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
            queued: slots.len(),
        }
    }
}
