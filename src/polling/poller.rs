//! Report poller
//!
//! Keeps the cached report list and statistics close to the server without
//! the caller asking for it. Polls run on a fixed interval and whenever a
//! trigger arrives (focus, reconnect, cache invalidation). `refresh()` polls
//! on the caller's task and propagates errors.
//!
//! Responses are applied in issue order per resource: a response is dropped
//! when a later-issued request for the same resource was already applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::types::{PollTrigger, PollingSnapshot, SnapshotListener, SnapshotUpdate};
use crate::cache::QueryCache;
use crate::config::PollingConfig;
use crate::error::Result;
use crate::reports::{Paginated, Report, ReportFilters, ReportStatistics, ReportStore, StatisticsFilters};

/// Poller handle
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    store: Arc<dyn ReportStore>,
    cache: QueryCache,
    config: PollingConfig,
    state: Mutex<PollerState>,
    snapshot_tx: watch::Sender<PollingSnapshot>,
    listeners: RwLock<Vec<Arc<dyn SnapshotListener>>>,
    list_seq: AtomicU64,
    stats_seq: AtomicU64,
}

#[derive(Default)]
struct PollerState {
    filters: ReportFilters,
    applied_list_seq: u64,
    applied_stats_seq: u64,
    task: Option<JoinHandle<()>>,
    triggers: Option<mpsc::UnboundedSender<PollTrigger>>,
}

impl Poller {
    pub fn new(store: Arc<dyn ReportStore>, cache: QueryCache, config: PollingConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(PollingSnapshot::default());

        Self {
            inner: Arc::new(PollerInner {
                store,
                cache,
                config,
                state: Mutex::new(PollerState::default()),
                snapshot_tx,
                listeners: RwLock::new(Vec::new()),
                list_seq: AtomicU64::new(0),
                stats_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener called after every applied list response
    pub fn add_listener(&self, listener: Arc<dyn SnapshotListener>) {
        self.inner.listeners.write().push(listener);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start polling `filters` every `interval`, replacing any running loop
    ///
    /// The first poll runs immediately.
    pub fn start_polling(&self, filters: ReportFilters, interval: Duration) {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.inner.state.lock();
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.filters = filters.clone();
            state.triggers = Some(tx);

            let poller = self.clone();
            state.task = Some(tokio::spawn(async move {
                poller.run(interval, rx).await;
            }));
        }

        // New view, same notion of server freshness
        self.inner.snapshot_tx.send_modify(|snapshot| {
            *snapshot = PollingSnapshot {
                filters: filters.clone(),
                last_update: snapshot.last_update,
                ..Default::default()
            };
        });

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            branch_id = ?filters.branch_id,
            status = ?filters.status,
            page = filters.page,
            "Polling started"
        );
    }

    pub fn stop_polling(&self) {
        let mut state = self.inner.state.lock();
        state.triggers = None;
        if let Some(task) = state.task.take() {
            task.abort();
            tracing::info!("Polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        let state = self.inner.state.lock();
        state.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    async fn run(self, interval: Duration, mut triggers: mpsc::UnboundedReceiver<PollTrigger>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => PollTrigger::Interval,
                received = triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = self.inner.cache.invalidated() => PollTrigger::Invalidated,
            };

            if trigger != PollTrigger::Interval {
                ticker.reset();
            }

            // Errors are already recorded on the snapshot; the next tick retries
            let _ = self.poll_once(trigger).await;
        }
    }

    // ========================================================================
    // Triggers
    // ========================================================================

    /// Poll now, on the caller's task
    ///
    /// A list failure is returned before a statistics failure.
    pub async fn refresh(&self) -> Result<PollingSnapshot> {
        let (list, statistics) = self.poll_once(PollTrigger::Manual).await;
        list?;
        statistics?;
        Ok(self.snapshot())
    }

    /// The host regained focus; returns whether a poll was requested
    pub fn notify_focus(&self) -> bool {
        self.inner.config.refetch_on_focus && self.send_trigger(PollTrigger::Focus)
    }

    /// The network came back; returns whether a poll was requested
    pub fn notify_reconnect(&self) -> bool {
        self.inner.config.refetch_on_reconnect && self.send_trigger(PollTrigger::Reconnect)
    }

    fn send_trigger(&self, trigger: PollTrigger) -> bool {
        let state = self.inner.state.lock();
        state
            .triggers
            .as_ref()
            .is_some_and(|tx| tx.send(trigger).is_ok())
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    async fn poll_once(&self, trigger: PollTrigger) -> (Result<()>, Result<()>) {
        let filters = self.filters();
        let stats_filters = filters.statistics_filters();
        let list_seq = self.inner.list_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let stats_seq = self.inner.stats_seq.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::debug!(?trigger, list_seq, stats_seq, "Polling reports");

        // Statistics do not wait for the list
        let (list, statistics) = futures::future::join(
            self.inner.store.list_reports(&filters),
            self.inner.store.report_statistics(&stats_filters),
        )
        .await;

        (
            self.apply_list(list_seq, filters, list),
            self.apply_statistics(stats_seq, stats_filters, statistics),
        )
    }

    fn apply_list(&self, seq: u64, filters: ReportFilters, result: Result<Paginated<Report>>) -> Result<()> {
        let current = {
            let mut state = self.inner.state.lock();
            if seq <= state.applied_list_seq {
                tracing::debug!(seq, applied = state.applied_list_seq, "Discarding stale list response");
                return Ok(());
            }
            state.applied_list_seq = seq;
            state.filters.clone()
        };

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "Report list poll failed");
                if filters == current {
                    self.inner
                        .snapshot_tx
                        .send_modify(|snapshot| snapshot.list_error = Some(e.to_string()));
                }
                return Err(e);
            }
        };

        self.inner.cache.set_list(filters.clone(), page.clone());
        if filters != current {
            // Cached for later, but the caller moved on to another view
            return Ok(());
        }

        let previous_last_update = self.inner.snapshot_tx.borrow().last_update;
        let freshest = page.data.iter().map(|r| r.updated_at).max();
        let last_update = previous_last_update.max(freshest);
        let changed: Vec<Report> = page
            .data
            .iter()
            .filter(|r| is_newer(r.updated_at, previous_last_update))
            .cloned()
            .collect();

        if !changed.is_empty() {
            tracing::debug!(
                changed = changed.len(),
                last_update = ?last_update,
                "Server reports changed"
            );
        }

        let update = SnapshotUpdate {
            filters: filters.clone(),
            reports: page.data.clone(),
            changed,
            previous_last_update,
            last_update,
        };
        let listeners: Vec<Arc<dyn SnapshotListener>> = self.inner.listeners.read().clone();
        for listener in &listeners {
            listener.on_snapshot(&update);
        }

        // Publish the cached view so subscribers see optimistic state re-applied
        let reports = self.inner.cache.get_list(&filters).unwrap_or(page);
        self.inner.snapshot_tx.send_modify(|snapshot| {
            snapshot.filters = filters;
            snapshot.reports = Some(reports);
            snapshot.last_update = last_update;
            snapshot.list_error = None;
            snapshot.fetched_at = Some(Utc::now());
        });
        Ok(())
    }

    fn apply_statistics(
        &self,
        seq: u64,
        filters: StatisticsFilters,
        result: Result<ReportStatistics>,
    ) -> Result<()> {
        let current = {
            let mut state = self.inner.state.lock();
            if seq <= state.applied_stats_seq {
                tracing::debug!(seq, applied = state.applied_stats_seq, "Discarding stale statistics response");
                return Ok(());
            }
            state.applied_stats_seq = seq;
            state.filters.statistics_filters()
        };

        match result {
            Ok(statistics) => {
                self.inner.cache.set_statistics(filters.clone(), statistics.clone());
                if filters == current {
                    self.inner.snapshot_tx.send_modify(|snapshot| {
                        snapshot.statistics = Some(statistics);
                        snapshot.statistics_error = None;
                    });
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Report statistics poll failed");
                if filters == current {
                    self.inner
                        .snapshot_tx
                        .send_modify(|snapshot| snapshot.statistics_error = Some(e.to_string()));
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn snapshot(&self) -> PollingSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollingSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn filters(&self) -> ReportFilters {
        self.inner.state.lock().filters.clone()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner.snapshot_tx.borrow().last_update
    }

    pub fn list_error(&self) -> Option<String> {
        self.inner.snapshot_tx.borrow().list_error.clone()
    }

    pub fn statistics_error(&self) -> Option<String> {
        self.inner.snapshot_tx.borrow().statistics_error.clone()
    }
}

fn is_newer(updated_at: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> bool {
    previous.map_or(true, |previous| updated_at > previous)
}
