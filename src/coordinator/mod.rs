//! Concurrency coordinator
//!
//! - `queue`: admission control, timeouts and conflict bridging
//! - `types`: queue items and their lifecycle

mod queue;
mod types;

pub use queue::UpdateCoordinator;
pub use types::{QueueItemStatus, UpdateQueueItem};
