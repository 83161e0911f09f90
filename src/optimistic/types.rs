//! Optimistic update types
//!
//! Defines the mutations the engine applies, the bookkeeping it keeps for
//! each in-flight update, and the conflict records it raises.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::UpdateConfig;
use crate::reports::{ApprovalRequest, DeclineRequest, Report, ReportPatch, ReportStatus};

/// Types of report mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Approve,
    Decline,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::Approve => "approve",
            MutationKind::Decline => "decline",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Mutation-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MutationPayload {
    Approve(ApprovalRequest),
    Decline(DeclineRequest),
    Update(ReportPatch),
    Delete,
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::Approve(_) => MutationKind::Approve,
            MutationPayload::Decline(_) => MutationKind::Decline,
            MutationPayload::Update(_) => MutationKind::Update,
            MutationPayload::Delete => MutationKind::Delete,
        }
    }

    /// The fields the mutation is expected to leave on the report
    ///
    /// `None` for delete, which removes the report instead of patching it.
    pub fn optimistic_patch(&self, now: DateTime<Utc>) -> Option<ReportPatch> {
        match self {
            MutationPayload::Approve(req) => Some(ReportPatch {
                status: Some(ReportStatus::Approved),
                approved_by: Some(req.approved_by.clone()),
                approved_at: Some(now),
                ..Default::default()
            }),
            MutationPayload::Decline(req) => Some(ReportPatch {
                status: Some(ReportStatus::Declined),
                approved_by: Some(req.approved_by.clone()),
                approved_at: Some(now),
                decline_reason: Some(req.reason.clone()),
                ..Default::default()
            }),
            MutationPayload::Update(patch) => Some(patch.clone()),
            MutationPayload::Delete => None,
        }
    }
}

/// One logical mutation against one report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub report_id: String,
    pub payload: MutationPayload,
}

impl MutationRequest {
    pub fn new(report_id: impl Into<String>, payload: MutationPayload) -> Self {
        Self {
            report_id: report_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }
}

/// Local bookkeeping for a mutation whose result is not yet confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisticUpdate {
    pub id: String,
    pub report_id: String,
    pub kind: MutationKind,
    /// Report as it was before the patch; restored on rollback
    pub original_data: Report,
    /// Patch applied locally, `None` for delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<ReportPatch>,
    /// Server time the local state is based on; server copies newer than
    /// this are checked for conflicts
    pub timestamp: DateTime<Utc>,
}

/// How a conflict between local and server state is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Server status differs from the status the update assumed
    Status,
    /// Server copy is newer, status unchanged
    Version,
    /// Field values differ without a status or version explanation
    Data,
}

/// Strategy applied when a conflict is detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Discard the local patch and adopt server data
    #[serde(alias = "server_wins")]
    UseServer,
    /// Server data overlaid with the local patch
    #[serde(alias = "client_wins")]
    UseLocal,
    /// User-editable fields from the local patch, workflow fields from the server
    Merge,
    /// Hold the conflict until a user picks a side
    #[serde(alias = "manual")]
    PromptUser,
}

impl ConflictStrategy {
    /// The choice an automatic strategy makes, `None` for `PromptUser`
    pub fn automatic_choice(&self) -> Option<ConflictChoice> {
        match self {
            ConflictStrategy::UseServer => Some(ConflictChoice::UseServer),
            ConflictStrategy::UseLocal => Some(ConflictChoice::UseLocal),
            ConflictStrategy::Merge => Some(ConflictChoice::Merge),
            ConflictStrategy::PromptUser => None,
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server_wins" | "use_server" => Ok(ConflictStrategy::UseServer),
            "client_wins" | "use_local" => Ok(ConflictStrategy::UseLocal),
            "merge" => Ok(ConflictStrategy::Merge),
            "prompt_user" | "manual" => Ok(ConflictStrategy::PromptUser),
            other => Err(format!("unknown conflict strategy: {}", other)),
        }
    }
}

/// A side picked for one conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    UseServer,
    UseLocal,
    Merge,
}

/// A disagreement between an optimistic update and a newer server copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub update: OptimisticUpdate,
    pub server_data: Report,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub detected_at: DateTime<Utc>,
}

/// A conflict found during one reconcile pass
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub update_id: String,
    pub report_id: String,
    pub conflict_type: ConflictType,
    /// `None` when the conflict was queued for a user decision
    pub resolved_with: Option<ConflictChoice>,
}

/// Retry policy for a single mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `retry_delay * 2^attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

impl From<&UpdateConfig> for RetryPolicy {
    fn from(config: &UpdateConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&UpdateConfig::default())
    }
}
