//! Shared query cache with LRU eviction
//!
//! Holds every locally known view of report data: list pages keyed by their
//! filters, single-report entries, and statistics. The Poller and the
//! Optimistic Update Engine are the only writers.
//!
//! # Atomicity
//!
//! All state sits behind one `parking_lot::Mutex` that is never held across an
//! await point. Every write replaces a whole page or a whole record, so
//! readers never observe a half-applied change.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::CacheConfig;
use crate::reports::{Paginated, Report, ReportFilters, ReportStatistics, StatisticsFilters};

const DEFAULT_MAX_LIST_PAGES: usize = 50;

/// A cached value with freshness bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
    /// Set by invalidation, cleared by the next write
    pub stale: bool,
}

impl<T> CacheEntry<T> {
    fn fresh(data: T) -> Self {
        Self {
            data,
            fetched_at: Utc::now(),
            stale: false,
        }
    }
}

/// Which queries an invalidation marks stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// List pages and single-report entries
    Reports,
    Statistics,
    All,
}

/// Shared cache handle
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<QueryCacheInner>,
}

struct QueryCacheInner {
    state: Mutex<CacheState>,
    /// Wakes the Poller when cached data must be refetched
    invalidated: Notify,
}

struct CacheState {
    lists: LruCache<ReportFilters, CacheEntry<Paginated<Report>>>,
    reports: HashMap<String, CacheEntry<Report>>,
    statistics: HashMap<StatisticsFilters, CacheEntry<ReportStatistics>>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_list_pages)
            .or(NonZeroUsize::new(DEFAULT_MAX_LIST_PAGES))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(QueryCacheInner {
                state: Mutex::new(CacheState {
                    lists: LruCache::new(capacity),
                    reports: HashMap::new(),
                    statistics: HashMap::new(),
                }),
                invalidated: Notify::new(),
            }),
        }
    }

    // ========================================================================
    // List pages
    // ========================================================================

    pub fn get_list(&self, filters: &ReportFilters) -> Option<Paginated<Report>> {
        let mut state = self.inner.state.lock();
        state.lists.get(filters).map(|entry| entry.data.clone())
    }

    pub fn is_list_stale(&self, filters: &ReportFilters) -> bool {
        let state = self.inner.state.lock();
        state.lists.peek(filters).map_or(true, |entry| entry.stale)
    }

    /// Store a freshly fetched page
    ///
    /// Single-report entries for reports on the page are replaced too, since
    /// the page is the newer server copy.
    pub fn set_list(&self, filters: ReportFilters, page: Paginated<Report>) {
        let mut state = self.inner.state.lock();
        for report in &page.data {
            if let Some(entry) = state.reports.get_mut(&report.id) {
                *entry = CacheEntry::fresh(report.clone());
            }
        }
        state.lists.put(filters, CacheEntry::fresh(page));
    }

    /// All cached pages, most recently used first
    pub fn lists(&self) -> Vec<(ReportFilters, Paginated<Report>)> {
        let state = self.inner.state.lock();
        state
            .lists
            .iter()
            .map(|(filters, entry)| (filters.clone(), entry.data.clone()))
            .collect()
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Find a report in the single-report entries, then in any list page
    pub fn get_report(&self, report_id: &str) -> Option<Report> {
        let state = self.inner.state.lock();
        if let Some(entry) = state.reports.get(report_id) {
            return Some(entry.data.clone());
        }
        state
            .lists
            .iter()
            .find_map(|(_, entry)| entry.data.data.iter().find(|r| r.id == report_id))
            .cloned()
    }

    pub fn contains_report(&self, report_id: &str) -> bool {
        self.get_report(report_id).is_some()
    }

    /// Store a report as its own entry and replace it in every page holding it
    pub fn set_report(&self, report: Report) {
        let mut state = self.inner.state.lock();
        replace_in_lists(&mut state, &report);
        state
            .reports
            .insert(report.id.clone(), CacheEntry::fresh(report));
    }

    /// Replace a report wherever it is cached; returns whether any view held it
    pub fn replace_report(&self, report: &Report) -> bool {
        let mut state = self.inner.state.lock();
        let mut found = replace_in_lists(&mut state, report);
        if let Some(entry) = state.reports.get_mut(&report.id) {
            entry.data = report.clone();
            found = true;
        }
        found
    }

    /// Rewrite every cached copy of a report through `f`
    ///
    /// Each view keeps its own copy, so `f` sees whatever that view held.
    pub fn update_report<F>(&self, report_id: &str, f: F) -> bool
    where
        F: Fn(&Report) -> Report,
    {
        let mut state = self.inner.state.lock();
        let mut found = false;
        for (_, entry) in state.lists.iter_mut() {
            for report in entry.data.data.iter_mut().filter(|r| r.id == report_id) {
                *report = f(report);
                found = true;
            }
        }
        if let Some(entry) = state.reports.get_mut(report_id) {
            entry.data = f(&entry.data);
            found = true;
        }
        found
    }

    /// Drop a report from every view, decrementing the cached list totals
    pub fn remove_report(&self, report_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        let mut found = state.reports.remove(report_id).is_some();
        for (_, entry) in state.lists.iter_mut() {
            let page = &mut entry.data;
            let before = page.data.len();
            page.data.retain(|r| r.id != report_id);
            let removed = (before - page.data.len()) as u64;
            if removed > 0 {
                found = true;
                let pagination = &mut page.pagination;
                pagination.total = pagination.total.saturating_sub(removed);
                if pagination.limit > 0 {
                    let limit = u64::from(pagination.limit);
                    pagination.total_pages = ((pagination.total + limit - 1) / limit) as u32;
                }
            }
        }
        found
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn get_statistics(&self, filters: &StatisticsFilters) -> Option<ReportStatistics> {
        let state = self.inner.state.lock();
        state.statistics.get(filters).map(|entry| entry.data.clone())
    }

    pub fn is_statistics_stale(&self, filters: &StatisticsFilters) -> bool {
        let state = self.inner.state.lock();
        state.statistics.get(filters).map_or(true, |entry| entry.stale)
    }

    pub fn set_statistics(&self, filters: StatisticsFilters, statistics: ReportStatistics) {
        let mut state = self.inner.state.lock();
        state
            .statistics
            .insert(filters, CacheEntry::fresh(statistics));
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Mark queries stale and ask the Poller for a refetch
    pub fn invalidate(&self, scope: InvalidateScope) {
        {
            let mut state = self.inner.state.lock();
            if matches!(scope, InvalidateScope::Reports | InvalidateScope::All) {
                for (_, entry) in state.lists.iter_mut() {
                    entry.stale = true;
                }
                for entry in state.reports.values_mut() {
                    entry.stale = true;
                }
            }
            if matches!(scope, InvalidateScope::Statistics | InvalidateScope::All) {
                for entry in state.statistics.values_mut() {
                    entry.stale = true;
                }
            }
        }

        tracing::debug!(?scope, "Cache invalidated");
        // notify_one keeps a permit if the Poller is mid-fetch, so the wake is not lost
        self.inner.invalidated.notify_one();
    }

    /// Resolves at the next invalidation
    pub async fn invalidated(&self) {
        self.inner.invalidated.notified().await;
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.lists.clear();
        state.reports.clear();
        state.statistics.clear();
    }
}

fn replace_in_lists(state: &mut CacheState, report: &Report) -> bool {
    let mut found = false;
    for (_, entry) in state.lists.iter_mut() {
        for slot in entry.data.data.iter_mut().filter(|r| r.id == report.id) {
            *slot = report.clone();
            found = true;
        }
    }
    found
}
