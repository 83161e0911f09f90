//! Fixtures and an in-memory report backend for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::{Result, SyncError};
use crate::polling::SnapshotUpdate;
use crate::reports::{
    ApprovalRequest, DeclineRequest, Paginated, Pagination, Report, ReportFilters, ReportPatch,
    ReportStatistics, ReportStatus, ReportStore, StatisticsFilters,
};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
}

pub fn report(id: &str, status: ReportStatus) -> Report {
    Report {
        id: id.to_string(),
        report_type: "daily".to_string(),
        status,
        branch_id: "branch-1".to_string(),
        credit_officer_id: Some("officer-1".to_string()),
        author_id: "author-1".to_string(),
        approved_by: None,
        approved_at: None,
        decline_reason: None,
        remarks: None,
        total_disbursed: 10_000.0,
        total_collected: 7_500.0,
        loans_disbursed: 4,
        clients_served: 12,
        created_at: base_time(),
        updated_at: base_time(),
    }
}

/// A single page of pending reports
pub fn page(ids: &[&str]) -> Paginated<Report> {
    paginate(ids.iter().map(|id| report(id, ReportStatus::Pending)).collect())
}

fn paginate(data: Vec<Report>) -> Paginated<Report> {
    let total = data.len() as u64;
    Paginated {
        pagination: Pagination {
            page: 1,
            limit: 20,
            total,
            total_pages: if total == 0 { 0 } else { 1 },
        },
        data,
    }
}

/// A snapshot update treating every report as changed
pub fn snapshot_of(reports: &[Report]) -> SnapshotUpdate {
    SnapshotUpdate {
        filters: ReportFilters::default(),
        reports: reports.to_vec(),
        changed: reports.to_vec(),
        previous_last_update: None,
        last_update: reports.iter().map(|r| r.updated_at).max(),
    }
}

/// In-memory backend with failure and latency injection
#[derive(Default)]
pub struct MockReportStore {
    reports: Mutex<Vec<Report>>,
    failing_mutations: Mutex<u32>,
    mutation_delay: Mutex<Duration>,
    mutation_delays: Mutex<VecDeque<Duration>>,
    list_delays: Mutex<VecDeque<Duration>>,
    fail_lists: Mutex<bool>,
    fail_statistics: Mutex<bool>,
    mutation_calls: AtomicUsize,
    list_calls: AtomicUsize,
    statistics_calls: AtomicUsize,
}

impl MockReportStore {
    pub fn with_ids(ids: &[&str]) -> Self {
        let store = Self::default();
        *store.reports.lock() = page(ids).data;
        store
    }

    /// The server's current page
    pub fn page(&self) -> Paginated<Report> {
        paginate(self.reports.lock().clone())
    }

    pub fn report(&self, report_id: &str) -> Option<Report> {
        self.reports.lock().iter().find(|r| r.id == report_id).cloned()
    }

    /// Fail the next `count` mutation calls
    pub fn fail_mutations(&self, count: u32) {
        *self.failing_mutations.lock() = count;
    }

    pub fn set_mutation_delay(&self, delay: Duration) {
        *self.mutation_delay.lock() = delay;
    }

    /// Delay the next mutation calls, one entry per call, ahead of the fixed delay
    pub fn push_mutation_delay(&self, delay: Duration) {
        self.mutation_delays.lock().push_back(delay);
    }

    /// Delay the next list calls, one entry per call
    pub fn push_list_delay(&self, delay: Duration) {
        self.list_delays.lock().push_back(delay);
    }

    pub fn fail_lists(&self, fail: bool) {
        *self.fail_lists.lock() = fail;
    }

    pub fn fail_statistics(&self, fail: bool) {
        *self.fail_statistics.lock() = fail;
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn statistics_calls(&self) -> usize {
        self.statistics_calls.load(Ordering::SeqCst)
    }

    /// Change a report as another client would, bumping its version
    pub fn server_edit<F>(&self, report_id: &str, edit: F) -> Report
    where
        F: FnOnce(&mut Report),
    {
        self.edit_with_version(report_id, edit, |previous| {
            next_version(previous, chrono::Duration::milliseconds(1))
        })
    }

    /// Change a report and stamp it with `updated_at` from a server clock
    /// that may disagree with this machine's
    pub fn server_edit_at<F>(&self, report_id: &str, updated_at: DateTime<Utc>, edit: F) -> Report
    where
        F: FnOnce(&mut Report),
    {
        self.edit_with_version(report_id, edit, |_| updated_at)
    }

    fn edit_with_version<F, V>(&self, report_id: &str, edit: F, version: V) -> Report
    where
        F: FnOnce(&mut Report),
        V: FnOnce(DateTime<Utc>) -> DateTime<Utc>,
    {
        let mut reports = self.reports.lock();
        let report = reports
            .iter_mut()
            .find(|r| r.id == report_id)
            .expect("server edit on unknown report");
        edit(report);
        report.updated_at = version(report.updated_at);
        report.clone()
    }

    async fn begin_mutation(&self) -> Result<()> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.mutation_delays.lock().pop_front();
        let delay = queued.unwrap_or_else(|| *self.mutation_delay.lock());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut failing = self.failing_mutations.lock();
        if *failing > 0 {
            *failing -= 1;
            return Err(SyncError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    fn mutate(&self, report_id: &str, patch: &ReportPatch) -> Result<Report> {
        let mut reports = self.reports.lock();
        let report = reports
            .iter_mut()
            .find(|r| r.id == report_id)
            .ok_or_else(|| SyncError::Api {
                status: 404,
                message: format!("Report {} not found", report_id),
            })?;
        *report = patch.apply_to(report);
        report.updated_at = next_version(report.updated_at, chrono::Duration::seconds(1));
        Ok(report.clone())
    }
}

fn next_version(previous: DateTime<Utc>, step: chrono::Duration) -> DateTime<Utc> {
    (previous + step).max(Utc::now() + chrono::Duration::milliseconds(1))
}

#[async_trait]
impl ReportStore for MockReportStore {
    async fn list_reports(&self, _filters: &ReportFilters) -> Result<Paginated<Report>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        // Snapshot before the delay, like a response already on the wire
        let page = self.page();
        let delay = self.list_delays.lock().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_lists.lock() {
            return Err(SyncError::Network("list unavailable".to_string()));
        }
        Ok(page)
    }

    async fn report_statistics(&self, _filters: &StatisticsFilters) -> Result<ReportStatistics> {
        self.statistics_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_statistics.lock() {
            return Err(SyncError::Network("statistics unavailable".to_string()));
        }

        let reports = self.reports.lock();
        let count = |status: ReportStatus| reports.iter().filter(|r| r.status == status).count() as u64;
        Ok(ReportStatistics {
            total_reports: reports.len() as u64,
            pending_reports: count(ReportStatus::Pending),
            approved_reports: count(ReportStatus::Approved),
            declined_reports: count(ReportStatus::Declined),
            overdue_reports: 0,
        })
    }

    async fn approve_report(&self, report_id: &str, request: &ApprovalRequest) -> Result<Report> {
        self.begin_mutation().await?;
        self.mutate(
            report_id,
            &ReportPatch {
                status: Some(ReportStatus::Approved),
                approved_by: Some(request.approved_by.clone()),
                approved_at: Some(Utc::now()),
                ..Default::default()
            },
        )
    }

    async fn decline_report(&self, report_id: &str, request: &DeclineRequest) -> Result<Report> {
        self.begin_mutation().await?;
        if request.reason.is_empty() {
            return Err(SyncError::Api {
                status: 422,
                message: "Decline reason is required".to_string(),
            });
        }
        self.mutate(
            report_id,
            &ReportPatch {
                status: Some(ReportStatus::Declined),
                approved_by: Some(request.approved_by.clone()),
                approved_at: Some(Utc::now()),
                decline_reason: Some(request.reason.clone()),
                ..Default::default()
            },
        )
    }

    async fn update_report(&self, report_id: &str, patch: &ReportPatch) -> Result<Report> {
        self.begin_mutation().await?;
        self.mutate(report_id, patch)
    }

    async fn delete_report(&self, report_id: &str) -> Result<()> {
        self.begin_mutation().await?;
        let mut reports = self.reports.lock();
        let before = reports.len();
        reports.retain(|r| r.id != report_id);
        if reports.len() == before {
            return Err(SyncError::Api {
                status: 404,
                message: format!("Report {} not found", report_id),
            });
        }
        Ok(())
    }
}
