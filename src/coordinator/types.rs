//! Queue item types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::optimistic::{MutationKind, MutationPayload, MutationRequest, OptimisticEngine};
use crate::reports::Report;

/// Queue item lifecycle: `pending -> processing -> completed | failed`
///
/// `failed -> pending` happens only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A mutation waiting for or undergoing execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQueueItem {
    /// Also the id of the optimistic update the engine tracks for this item
    pub id: String,
    pub kind: MutationKind,
    pub report_id: String,
    pub payload: MutationPayload,
    /// Enqueue time, client clock
    pub timestamp: DateTime<Utc>,
    /// Server `updated_at` of the report as known at enqueue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: QueueItemStatus,
}

impl UpdateQueueItem {
    pub fn new(
        report_id: impl Into<String>,
        payload: MutationPayload,
        base_version: Option<DateTime<Utc>>,
    ) -> Self {
        let report_id = report_id.into();
        let kind = payload.kind();

        Self {
            id: OptimisticEngine::update_id(kind, &report_id),
            kind,
            report_id,
            payload,
            timestamp: Utc::now(),
            base_version,
            retry_count: 0,
            status: QueueItemStatus::Pending,
        }
    }

    pub fn request(&self) -> MutationRequest {
        MutationRequest::new(self.report_id.clone(), self.payload.clone())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, QueueItemStatus::Completed | QueueItemStatus::Failed)
    }

    /// Whether a server copy carries changes made after this item was queued
    ///
    /// Compares server times only. An item queued for a report that was not
    /// cached is superseded by any change.
    pub fn is_superseded_by(&self, server: &Report) -> bool {
        server.id == self.report_id && self.base_version.map_or(true, |base| server.updated_at > base)
    }
}
