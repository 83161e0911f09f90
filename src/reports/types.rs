//! Report data types
//!
//! Wire shapes of the remote report backend: reports, partial patches,
//! list filters, pagination and aggregate statistics.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Draft,
    Submitted,
    Pending,
    Approved,
    Declined,
    Forwarded,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "draft",
            ReportStatus::Submitted => "submitted",
            ReportStatus::Pending => "pending",
            ReportStatus::Approved => "approved",
            ReportStatus::Declined => "declined",
            ReportStatus::Forwarded => "forwarded",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A branch or credit officer report as served by the backend
///
/// `updated_at` is maintained by the server and is the only authority for
/// freshness. Optimistic patches never touch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub report_type: String,
    pub status: ReportStatus,
    pub branch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_officer_id: Option<String>,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default)]
    pub total_disbursed: f64,
    #[serde(default)]
    pub total_collected: f64,
    #[serde(default)]
    pub loans_disbursed: u32,
    #[serde(default)]
    pub clients_served: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial set of report fields sent with an update, or applied locally as
/// the expected result of a mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_disbursed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_collected: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loans_disbursed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_served: Option<u32>,
}

impl ReportPatch {
    /// Return a copy of `report` with every set field of the patch written over it
    pub fn apply_to(&self, report: &Report) -> Report {
        let mut patched = report.clone();
        if let Some(status) = self.status {
            patched.status = status;
        }
        if let Some(approved_by) = &self.approved_by {
            patched.approved_by = Some(approved_by.clone());
        }
        if let Some(approved_at) = self.approved_at {
            patched.approved_at = Some(approved_at);
        }
        if let Some(reason) = &self.decline_reason {
            patched.decline_reason = Some(reason.clone());
        }
        if let Some(remarks) = &self.remarks {
            patched.remarks = Some(remarks.clone());
        }
        if let Some(v) = self.total_disbursed {
            patched.total_disbursed = v;
        }
        if let Some(v) = self.total_collected {
            patched.total_collected = v;
        }
        if let Some(v) = self.loans_disbursed {
            patched.loans_disbursed = v;
        }
        if let Some(v) = self.clients_served {
            patched.clients_served = v;
        }
        patched
    }

    /// Names of the patched fields whose value in `report` differs from the patch
    ///
    /// `approved_at` is a server timestamp and never counts as a difference.
    pub fn changed_fields(&self, report: &Report) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.status.is_some_and(|s| s != report.status) {
            fields.push("status");
        }
        if self
            .approved_by
            .as_ref()
            .is_some_and(|v| report.approved_by.as_ref() != Some(v))
        {
            fields.push("approvedBy");
        }
        if self
            .decline_reason
            .as_ref()
            .is_some_and(|v| report.decline_reason.as_ref() != Some(v))
        {
            fields.push("declineReason");
        }
        if self
            .remarks
            .as_ref()
            .is_some_and(|v| report.remarks.as_ref() != Some(v))
        {
            fields.push("remarks");
        }
        if self.total_disbursed.is_some_and(|v| v != report.total_disbursed) {
            fields.push("totalDisbursed");
        }
        if self.total_collected.is_some_and(|v| v != report.total_collected) {
            fields.push("totalCollected");
        }
        if self.loans_disbursed.is_some_and(|v| v != report.loans_disbursed) {
            fields.push("loansDisbursed");
        }
        if self.clients_served.is_some_and(|v| v != report.clients_served) {
            fields.push("clientsServed");
        }
        fields
    }

    /// The subset of the patch a user edits directly: metrics and remarks
    ///
    /// Status, approver, decline reason and timestamps are owned by the
    /// approval workflow on the server and are left out.
    pub fn user_editable(&self) -> ReportPatch {
        ReportPatch {
            remarks: self.remarks.clone(),
            total_disbursed: self.total_disbursed,
            total_collected: self.total_collected,
            loans_disbursed: self.loans_disbursed,
            clients_served: self.clients_served,
            ..Default::default()
        }
    }
}

/// Filters for the report list endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReportStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_officer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    pub page: u32,
    pub limit: u32,
}

impl Default for ReportFilters {
    fn default() -> Self {
        Self {
            branch_id: None,
            status: None,
            report_type: None,
            credit_officer_id: None,
            date_from: None,
            date_to: None,
            page: 1,
            limit: 20,
        }
    }
}

impl ReportFilters {
    /// The narrower filter set the statistics endpoint understands
    pub fn statistics_filters(&self) -> StatisticsFilters {
        StatisticsFilters {
            branch_id: self.branch_id.clone(),
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

/// Filters for the statistics endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u32,
}

/// One page of a paginated list response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Aggregate report counts for the dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatistics {
    pub total_reports: u64,
    pub pending_reports: u64,
    pub approved_reports: u64,
    pub declined_reports: u64,
    pub overdue_reports: u64,
}

/// Body of an approve call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approved_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of a decline call
///
/// The reason is required by the backend; it is not validated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineRequest {
    pub approved_by: String,
    pub reason: String,
}
