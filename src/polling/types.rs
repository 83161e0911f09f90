//! Polling types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::reports::{Paginated, Report, ReportFilters, ReportStatistics};

/// What caused a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollTrigger {
    Interval,
    Focus,
    Reconnect,
    /// A cache invalidation asked for fresh data
    Invalidated,
    Manual,
}

/// The Poller's latest view of the server
///
/// Replaced as a whole on every applied response, never edited in place.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingSnapshot {
    pub filters: ReportFilters,
    pub reports: Option<Paginated<Report>>,
    pub statistics: Option<ReportStatistics>,
    /// Freshest `updatedAt` seen across every fetched report
    pub last_update: Option<DateTime<Utc>>,
    pub list_error: Option<String>,
    pub statistics_error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Published to listeners after every applied list response
#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub filters: ReportFilters,
    /// Every report on the fetched page
    pub reports: Vec<Report>,
    /// Reports whose `updated_at` is newer than `previous_last_update`
    pub changed: Vec<Report>,
    pub previous_last_update: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl SnapshotUpdate {
    /// Whether the server moved past the previously known `last_update`
    pub fn advanced(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn report(&self, report_id: &str) -> Option<&Report> {
        self.reports.iter().find(|r| r.id == report_id)
    }

    pub fn changed_report(&self, report_id: &str) -> Option<&Report> {
        self.changed.iter().find(|r| r.id == report_id)
    }
}

/// Receives snapshot updates synchronously, right after the page is cached
///
/// Implementations must not block; they run on the polling task.
pub trait SnapshotListener: Send + Sync {
    fn on_snapshot(&self, update: &SnapshotUpdate);
}
