//! Report Sync
//!
//! Client-side synchronization core for loan report administration:
//! optimistic mutations, background polling and conflict resolution against
//! a shared report backend.
//!
//! # Modules
//!
//! - `reports`: Report model and the backend client
//! - `cache`: Shared query cache written by the Poller and the engine
//! - `polling`: Interval and trigger driven refresh of reports and statistics
//! - `optimistic`: Optimistic update engine and conflict resolution
//! - `coordinator`: Bounded, timed queue of mutation requests
//! - `service`: Facade wiring the pieces together

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod optimistic;
pub mod polling;
pub mod reports;
pub mod service;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Result, SyncError};
pub use service::ReportSyncService;
