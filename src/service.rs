//! Report sync service
//!
//! Wires the cache, Poller, optimistic engine and Coordinator together and
//! exposes the surface UI callers use. Mutations return a queue item id
//! right away; their outcome shows up in `update_queue()` and
//! `update_errors()`.
//!
//! Polling and mutations spawn Tokio tasks: the service must be used from
//! within a Tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::coordinator::{UpdateCoordinator, UpdateQueueItem};
use crate::error::Result;
use crate::optimistic::{
    Conflict, ConflictChoice, ConflictResolver, MutationPayload, OptimisticEngine, OptimisticUpdate,
    RetryPolicy,
};
use crate::polling::{Poller, PollingSnapshot};
use crate::reports::{
    ApprovalRequest, DeclineRequest, HttpReportStore, Paginated, Report, ReportFilters, ReportPatch,
    ReportStatistics, ReportStore,
};

/// Facade over the sync core
///
/// `start_polling` and the mutation methods panic when called outside a
/// Tokio runtime.
#[derive(Clone)]
pub struct ReportSyncService {
    config: Arc<Config>,
    cache: QueryCache,
    poller: Poller,
    engine: OptimisticEngine,
    coordinator: UpdateCoordinator,
}

impl ReportSyncService {
    pub fn new(store: Arc<dyn ReportStore>, config: Config) -> Self {
        let cache = QueryCache::new(&config.cache);
        let poller = Poller::new(store.clone(), cache.clone(), config.polling.clone());
        let engine = OptimisticEngine::new(
            store,
            cache.clone(),
            ConflictResolver::new(config.updates.conflict_resolution),
            RetryPolicy::from(&config.updates),
        );
        let coordinator = UpdateCoordinator::new(engine.clone(), config.updates.clone());
        poller.add_listener(Arc::new(coordinator.clone()));

        Self {
            config: Arc::new(config),
            cache,
            poller,
            engine,
            coordinator,
        }
    }

    /// Build a service talking to the configured REST backend
    pub fn from_config(config: Config) -> Result<Self> {
        let store = HttpReportStore::new(&config.api)?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Start polling `filters`, every `interval` or the configured default
    pub fn start_polling(&self, filters: ReportFilters, interval: Option<Duration>) {
        let interval = interval.unwrap_or(self.config.polling.interval);
        self.poller.start_polling(filters, interval);
    }

    pub fn stop_polling(&self) {
        self.poller.stop_polling();
    }

    pub async fn refresh(&self) -> Result<PollingSnapshot> {
        self.poller.refresh().await
    }

    pub fn notify_focus(&self) -> bool {
        self.poller.notify_focus()
    }

    pub fn notify_reconnect(&self) -> bool {
        self.poller.notify_reconnect()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollingSnapshot> {
        self.poller.subscribe()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn approve_report(&self, report_id: &str, request: ApprovalRequest) -> String {
        self.coordinator
            .queue_update(report_id, MutationPayload::Approve(request))
    }

    pub fn decline_report(&self, report_id: &str, request: DeclineRequest) -> String {
        self.coordinator
            .queue_update(report_id, MutationPayload::Decline(request))
    }

    pub fn update_report(&self, report_id: &str, patch: ReportPatch) -> String {
        self.coordinator
            .queue_update(report_id, MutationPayload::Update(patch))
    }

    pub fn delete_report(&self, report_id: &str) -> String {
        self.coordinator.queue_update(report_id, MutationPayload::Delete)
    }

    pub fn clear_queue(&self) {
        self.coordinator.clear_queue();
    }

    pub fn retry_failed_update(&self, update_id: &str) -> Result<()> {
        self.coordinator.retry_failed_update(update_id)
    }

    pub fn resolve_conflict(&self, index: usize, choice: ConflictChoice) -> Result<()> {
        self.engine.resolve_conflict(index, choice)
    }

    pub fn resolve_conflict_by_id(&self, conflict_id: &str, choice: ConflictChoice) -> Result<()> {
        self.engine.resolve_conflict_by_id(conflict_id, choice)
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// The current page, optimistic updates included
    pub fn reports(&self) -> Option<Paginated<Report>> {
        self.cache.get_list(&self.poller.filters())
    }

    pub fn statistics(&self) -> Option<ReportStatistics> {
        self.cache
            .get_statistics(&self.poller.filters().statistics_filters())
    }

    pub fn report(&self, report_id: &str) -> Option<Report> {
        self.cache.get_report(report_id)
    }

    pub fn snapshot(&self) -> PollingSnapshot {
        self.poller.snapshot()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_polling()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.poller.last_update()
    }

    pub fn update_queue(&self) -> Vec<UpdateQueueItem> {
        self.coordinator.update_queue()
    }

    pub fn processing_updates(&self) -> Vec<String> {
        self.coordinator.processing_updates()
    }

    pub fn update_errors(&self) -> HashMap<String, String> {
        self.coordinator.update_errors()
    }

    pub fn has_failed_updates(&self) -> bool {
        self.coordinator.has_failed_updates()
    }

    pub fn pending_optimistic_updates(&self) -> Vec<OptimisticUpdate> {
        self.engine.pending_updates()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.engine.conflicts()
    }

    /// Stop polling, drop queued work and forget cached data
    pub fn shutdown(&self) {
        self.poller.stop_polling();
        self.coordinator.clear_queue();
        self.cache.clear();
        tracing::info!("Report sync shut down");
    }
}
