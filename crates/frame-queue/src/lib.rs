//! Bounded Frame Queue
//!
//! Provides the single-slot (configurable depth) buffer that sits between a
//! camera driver callback and the acquisition loop. Pushing never blocks: when
//! the queue is full the oldest frame is discarded. Popping always yields the
//! newest frame and discards anything older.

mod queue;

pub use queue::{FrameQueue, PushOutcome, QueueStats, DEFAULT_CAPACITY};

use thiserror::Error;

/// Frame queue errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// A queue must hold at least one frame
    #[error("Queue capacity must be at least 1")]
    ZeroCapacity,
}
