//! Report polling
//!
//! - `poller`: the interval/trigger driven fetch loop
//! - `types`: snapshots, triggers and the listener hook

mod poller;
mod types;

pub use poller::Poller;
pub use types::{PollTrigger, PollingSnapshot, SnapshotListener, SnapshotUpdate};
