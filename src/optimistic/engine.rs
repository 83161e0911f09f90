//! Optimistic Update Engine
//!
//! Makes one logical mutation visible in the cache immediately, then
//! reconciles it with the server:
//! - success replaces the optimistic copy with the server's record
//! - failure is retried with exponential backoff, then rolled back
//! - newer server copies seen by the Poller are checked for conflicts and
//!   resolved with the configured strategy
//!
//! While a report has pending updates its cached copy is derived: the newest
//! server copy known for it, with the patch of every pending update on it
//! applied in the order the updates were made.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::conflict::{detect_conflict, ConflictResolver, ConflictWinner, ResolvedConflict};
use super::types::{
    Conflict, ConflictChoice, ConflictType, DetectedConflict, MutationKind, MutationPayload, MutationRequest,
    OptimisticUpdate, RetryPolicy,
};
use crate::cache::{InvalidateScope, QueryCache};
use crate::error::{Result, SyncError};
use crate::polling::SnapshotUpdate;
use crate::reports::{Report, ReportStore};

/// Optimistic update engine handle
#[derive(Clone)]
pub struct OptimisticEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn ReportStore>,
    cache: QueryCache,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    /// In-flight updates, in the order they were applied
    pending: Vec<OptimisticUpdate>,
    /// Newest server copy of every report with pending updates
    server_copies: HashMap<String, Report>,
    /// Conflicts waiting for a user decision, oldest first
    conflicts: Vec<Conflict>,
}

impl EngineState {
    fn get(&self, update_id: &str) -> Option<&OptimisticUpdate> {
        self.pending.iter().find(|u| u.id == update_id)
    }

    fn get_mut(&mut self, update_id: &str) -> Option<&mut OptimisticUpdate> {
        self.pending.iter_mut().find(|u| u.id == update_id)
    }

    /// Stop tracking an update, along with any conflict raised for it
    fn take(&mut self, update_id: &str) -> Option<OptimisticUpdate> {
        let index = self.pending.iter().position(|u| u.id == update_id)?;
        self.conflicts.retain(|c| c.update.id != update_id);
        Some(self.pending.remove(index))
    }

    /// Remember a server copy unless a newer one is already known
    fn observe(&mut self, server: &Report) {
        let newer = self
            .server_copies
            .get(&server.id)
            .map_or(true, |known| server.updated_at >= known.updated_at);
        if newer {
            self.server_copies.insert(server.id.clone(), server.clone());
        }
    }
}

impl OptimisticEngine {
    pub fn new(
        store: Arc<dyn ReportStore>,
        cache: QueryCache,
        resolver: ConflictResolver,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                cache,
                resolver,
                retry,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Build a synthetic update id unique per mutation, report and time
    pub fn update_id(kind: MutationKind, report_id: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            kind,
            report_id,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple()
        )
    }

    /// Server `updated_at` of the locally known copy of a report
    pub fn known_version(&self, report_id: &str) -> Option<DateTime<Utc>> {
        let state = self.inner.state.lock();
        match state.server_copies.get(report_id) {
            Some(server) => Some(server.updated_at),
            None => self.inner.cache.get_report(report_id).map(|r| r.updated_at),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one mutation to completion
    ///
    /// Returns the server's record (`None` for delete). A report missing from
    /// the cache fails with `NotFound` before anything is touched.
    pub async fn execute(&self, update_id: &str, request: &MutationRequest) -> Result<Option<Report>> {
        let report_id = request.report_id.as_str();
        let kind = request.kind();

        let original = self
            .inner
            .cache
            .get_report(report_id)
            .ok_or_else(|| SyncError::NotFound(report_id.to_string()))?;

        self.apply_optimistic(update_id, request, original);

        match self.call_with_retry(update_id, request).await {
            Ok(server) => {
                self.confirm(update_id, report_id, kind, server.as_ref());
                Ok(server)
            }
            Err(e) => {
                if self.rollback(update_id) {
                    tracing::error!(
                        update_id = %update_id,
                        report_id = %report_id,
                        kind = %kind,
                        error = %e,
                        "Optimistic update rolled back"
                    );
                } else {
                    tracing::debug!(update_id = %update_id, error = %e, "Failure of a settled update ignored");
                }
                Err(e)
            }
        }
    }

    fn apply_optimistic(&self, update_id: &str, request: &MutationRequest, original: Report) {
        let patch = request.payload.optimistic_patch(Utc::now());
        let report_id = request.report_id.clone();

        let mut state = self.inner.state.lock();
        // With nothing pending on the report, the cached copy is the server's
        state
            .server_copies
            .entry(report_id.clone())
            .or_insert_with(|| original.clone());
        state.pending.push(OptimisticUpdate {
            id: update_id.to_string(),
            report_id: report_id.clone(),
            kind: request.kind(),
            timestamp: original.updated_at,
            original_data: original,
            patch,
        });
        self.restore_view(&mut state, &report_id);

        tracing::debug!(
            update_id = %update_id,
            report_id = %report_id,
            kind = %request.kind(),
            "Applied optimistic update"
        );
    }

    async fn call_with_retry(&self, update_id: &str, request: &MutationRequest) -> Result<Option<Report>> {
        let retry = self.inner.retry;
        let mut attempt: u32 = 0;

        loop {
            match self.call_store(request).await {
                Ok(report) => return Ok(report),
                Err(e) if attempt < retry.max_retries => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        update_id = %update_id,
                        report_id = %request.report_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Report update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SyncError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    })
                }
            }
        }
    }

    async fn call_store(&self, request: &MutationRequest) -> Result<Option<Report>> {
        let store = &self.inner.store;
        let id = request.report_id.as_str();

        match &request.payload {
            MutationPayload::Approve(req) => store.approve_report(id, req).await.map(Some),
            MutationPayload::Decline(req) => store.decline_report(id, req).await.map(Some),
            MutationPayload::Update(patch) => store.update_report(id, patch).await.map(Some),
            MutationPayload::Delete => store.delete_report(id).await.map(|_| None),
        }
    }

    /// Drop the bookkeeping and adopt the server's record
    ///
    /// A result for an update that was already rolled back, abandoned or
    /// absorbed by a conflict resolution is not written to the cache.
    fn confirm(&self, update_id: &str, report_id: &str, kind: MutationKind, server: Option<&Report>) {
        let owned = {
            let mut state = self.inner.state.lock();
            let owned = state.take(update_id).is_some();
            if owned {
                match server {
                    Some(report) => {
                        state.observe(report);
                        // Updates still pending on the report now build on this version
                        for other in state.pending.iter_mut().filter(|u| u.report_id == report_id) {
                            other.timestamp = other.timestamp.max(report.updated_at);
                        }
                    }
                    None => {
                        self.inner.cache.remove_report(report_id);
                    }
                }
                self.restore_view(&mut state, report_id);
            }
            owned
        };

        if owned {
            tracing::info!(
                update_id = %update_id,
                report_id = %report_id,
                kind = %kind,
                "Report update confirmed"
            );
        } else {
            tracing::info!(
                update_id = %update_id,
                report_id = %report_id,
                kind = %kind,
                "Late success of a settled update, refetching"
            );
        }
        self.inner.cache.invalidate(InvalidateScope::All);
    }

    /// Undo the optimistic patch of a failed update
    ///
    /// The report is re-derived from its newest server copy and the updates
    /// still pending on it. A failed delete cannot be put back into list
    /// pages, so it forces a refetch. Returns whether the update was pending.
    fn rollback(&self, update_id: &str) -> bool {
        let kind = {
            let mut state = self.inner.state.lock();
            let Some(update) = state.take(update_id) else {
                return false;
            };
            self.restore_view(&mut state, &update.report_id);
            update.kind
        };

        if kind == MutationKind::Delete {
            self.inner.cache.invalidate(InvalidateScope::All);
        }
        true
    }

    /// Give up on an update whose outcome nobody waits for anymore
    ///
    /// The patch is rolled back now and whatever the store call returns later
    /// is ignored. Returns whether the update was still pending.
    pub fn abandon(&self, update_id: &str) -> bool {
        let abandoned = self.rollback(update_id);
        if abandoned {
            tracing::warn!(update_id = %update_id, "Optimistic update abandoned");
        }
        abandoned
    }

    /// Rewrite the cached copy of a report from its server copy and pending patches
    ///
    /// Caller holds the engine lock. The server copy is forgotten once no
    /// update on the report is pending.
    fn restore_view(&self, state: &mut EngineState, report_id: &str) {
        let Some(server) = state.server_copies.get(report_id) else {
            return;
        };

        let mut view = Some(server.clone());
        let mut idle = true;
        for update in state.pending.iter().filter(|u| u.report_id == report_id) {
            idle = false;
            view = match (&update.patch, view) {
                (Some(patch), Some(report)) => Some(patch.apply_to(&report)),
                _ => None,
            };
        }

        match view {
            Some(report) => {
                self.inner.cache.replace_report(&report);
            }
            None => {
                self.inner.cache.remove_report(report_id);
            }
        }
        if idle {
            state.server_copies.remove(report_id);
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Check a freshly cached page against every pending update
    ///
    /// Server copies that have not moved get the optimistic patches re-applied;
    /// newer copies that disagree with a patch are conflicts.
    pub fn reconcile(&self, snapshot: &SnapshotUpdate) -> Vec<DetectedConflict> {
        let mut detected = Vec::new();
        let mut cache_changed = false;
        let strategy = self.inner.resolver.strategy();

        {
            let mut state = self.inner.state.lock();
            let mut touched: Vec<String> = Vec::new();
            for update in &state.pending {
                if snapshot.report(&update.report_id).is_some() && !touched.contains(&update.report_id) {
                    touched.push(update.report_id.clone());
                }
            }
            for report_id in &touched {
                if let Some(server) = snapshot.report(report_id) {
                    state.observe(server);
                }
            }

            let update_ids: Vec<String> = state
                .pending
                .iter()
                .filter(|u| touched.contains(&u.report_id))
                .map(|u| u.id.clone())
                .collect();

            for update_id in update_ids {
                let Some(update) = state.get(&update_id).cloned() else {
                    continue;
                };
                let Some(server) = snapshot.report(&update.report_id) else {
                    continue;
                };

                let Some(conflict_type) = detect_conflict(&update, server) else {
                    if server.updated_at > update.timestamp {
                        // Server already agrees; an open prompt for this update is superseded
                        state.conflicts.retain(|c| c.update.id != update.id);
                    }
                    continue;
                };

                tracing::warn!(
                    update_id = %update.id,
                    report_id = %update.report_id,
                    conflict_type = ?conflict_type,
                    strategy = ?strategy,
                    "Conflict with newer server data"
                );

                match strategy.automatic_choice() {
                    Some(choice) => {
                        let resolved = self.inner.resolver.resolve(choice, &update, server);
                        apply_resolution(&mut state, &update, server, resolved);
                        cache_changed = true;
                    }
                    None => {
                        // Local intent stays visible until the user decides
                        cache_changed |= upsert_conflict(&mut state, &update, server, conflict_type);
                    }
                }

                detected.push(DetectedConflict {
                    update_id: update.id.clone(),
                    report_id: update.report_id.clone(),
                    conflict_type,
                    resolved_with: strategy.automatic_choice(),
                });
            }

            for report_id in &touched {
                self.restore_view(&mut state, report_id);
            }
        }

        // A conflict still waiting on the user is not a new resolution
        if cache_changed {
            self.inner.cache.invalidate(InvalidateScope::Statistics);
        }
        detected
    }

    // ========================================================================
    // Prompted conflicts
    // ========================================================================

    /// Resolve the conflict at `index` of `conflicts()` with an explicit choice
    pub fn resolve_conflict(&self, index: usize, choice: ConflictChoice) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if index >= state.conflicts.len() {
                return Err(SyncError::ConflictNotFound(format!("index {}", index)));
            }
            let conflict = state.conflicts.remove(index);
            self.settle_conflict(&mut state, conflict, choice);
        }
        self.inner.cache.invalidate(InvalidateScope::Statistics);
        Ok(())
    }

    /// Resolve a conflict by its id
    pub fn resolve_conflict_by_id(&self, conflict_id: &str, choice: ConflictChoice) -> Result<()> {
        let index = {
            let state = self.inner.state.lock();
            state.conflicts.iter().position(|c| c.id == conflict_id)
        };
        match index {
            Some(index) => self.resolve_conflict(index, choice),
            None => Err(SyncError::ConflictNotFound(conflict_id.to_string())),
        }
    }

    fn settle_conflict(&self, state: &mut EngineState, conflict: Conflict, choice: ConflictChoice) {
        let Some(update) = state.get(&conflict.update.id).cloned() else {
            tracing::debug!(conflict_id = %conflict.id, "Conflict outlived its update");
            return;
        };

        // Report vanished from every view (deleted on the server): nothing local to keep
        if update.kind != MutationKind::Delete && !self.inner.cache.contains_report(&update.report_id) {
            state.take(&update.id);
            self.restore_view(state, &update.report_id);
            tracing::info!(
                conflict_id = %conflict.id,
                report_id = %update.report_id,
                "Conflicted report is gone, resolved with server data"
            );
            return;
        }

        state.observe(&conflict.server_data);
        let resolved = self
            .inner
            .resolver
            .resolve(choice, &update, &conflict.server_data);
        apply_resolution(state, &update, &conflict.server_data, resolved);
        self.restore_view(state, &update.report_id);
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// In-flight updates, in the order they were applied
    pub fn pending_updates(&self) -> Vec<OptimisticUpdate> {
        self.inner.state.lock().pending.clone()
    }

    pub fn has_pending_update(&self, update_id: &str) -> bool {
        self.inner.state.lock().get(update_id).is_some()
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner.state.lock().conflicts.clone()
    }
}

/// Adjust the pending update a resolution applies to
///
/// The caller re-derives the cached report afterwards.
fn apply_resolution(state: &mut EngineState, update: &OptimisticUpdate, server: &Report, resolved: ResolvedConflict) {
    match resolved.winner {
        ConflictWinner::Server => {
            // The update no longer owns the cached record; its late result is ignored
            state.take(&update.id);
        }
        ConflictWinner::Local | ConflictWinner::Merged => {
            state.conflicts.retain(|c| c.update.id != update.id);
            if let Some(pending) = state.get_mut(&update.id) {
                pending.original_data = server.clone();
                pending.timestamp = server.updated_at;
                pending.patch = resolved.patch.clone();
            }
        }
    }

    tracing::info!(
        update_id = %update.id,
        report_id = %update.report_id,
        winner = ?resolved.winner,
        "Conflict resolved"
    );
}

/// Record a conflict for a user decision, replacing any older one for the same update
///
/// Returns whether the server copy differs from the one already recorded.
fn upsert_conflict(
    state: &mut EngineState,
    update: &OptimisticUpdate,
    server: &Report,
    conflict_type: ConflictType,
) -> bool {
    if let Some(existing) = state.conflicts.iter_mut().find(|c| c.update.id == update.id) {
        if existing.server_data == *server {
            return false;
        }
        existing.server_data = server.clone();
        existing.conflict_type = conflict_type;
        existing.detected_at = Utc::now();
        return true;
    }

    state.conflicts.push(Conflict {
        id: Uuid::new_v4().to_string(),
        update: update.clone(),
        server_data: server.clone(),
        conflict_type,
        detected_at: Utc::now(),
    });
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::optimistic::types::ConflictStrategy;
    use crate::reports::{ApprovalRequest, DeclineRequest, ReportFilters, ReportPatch, ReportStatus};
    use crate::test_support::{snapshot_of, MockReportStore};

    fn engine_with(store: Arc<MockReportStore>, strategy: ConflictStrategy, max_retries: u32) -> (OptimisticEngine, QueryCache) {
        let cache = QueryCache::default();
        cache.set_list(ReportFilters::default(), store.page());
        let engine = OptimisticEngine::new(
            store,
            cache.clone(),
            ConflictResolver::new(strategy),
            RetryPolicy {
                max_retries,
                retry_delay: Duration::from_millis(10),
            },
        );
        (engine, cache)
    }

    fn approve(report_id: &str) -> MutationRequest {
        MutationRequest::new(
            report_id,
            MutationPayload::Approve(ApprovalRequest {
                approved_by: "u1".to_string(),
                reason: Some("ok".to_string()),
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_approve_adopts_server_record() {
        let store = Arc::new(MockReportStore::with_ids(&["42"]));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 3);

        let result = engine.execute("u-1", &approve("42")).await.unwrap().unwrap();

        assert_eq!(result.status, ReportStatus::Approved);
        let cached = cache.get_report("42").unwrap();
        assert_eq!(cached.status, ReportStatus::Approved);
        assert_eq!(cached.updated_at, result.updated_at);
        assert!(engine.pending_updates().is_empty());
        assert!(cache.is_list_stale(&ReportFilters::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_report_fails_without_side_effects() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 3);
        let before = cache.get_list(&ReportFilters::default());

        let err = engine.execute("u-1", &approve("99")).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(store.mutation_calls(), 0);
        assert_eq!(cache.get_list(&ReportFilters::default()), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_restores_exact_snapshot() {
        let store = Arc::new(MockReportStore::with_ids(&["1", "2"]));
        store.fail_mutations(u32::MAX);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 2);
        let original = cache.get_report("2").unwrap();
        let original_json = serde_json::to_vec(&original).unwrap();

        let update = MutationRequest::new(
            "2",
            MutationPayload::Update(ReportPatch {
                total_collected: Some(1234.5),
                remarks: Some("recount".to_string()),
                ..Default::default()
            }),
        );
        let err = engine.execute("u-2", &update).await.unwrap_err();

        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
        let restored = cache.get_report("2").unwrap();
        assert_eq!(restored, original);
        assert_eq!(serde_json::to_vec(&restored).unwrap(), original_json);
        assert!(engine.pending_updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_max_retries_plus_one() {
        for max_retries in [0u32, 1, 4] {
            let store = Arc::new(MockReportStore::with_ids(&["1"]));
            store.fail_mutations(u32::MAX);
            let (engine, _cache) = engine_with(store.clone(), ConflictStrategy::UseServer, max_retries);

            let _ = engine.execute("u-1", &approve("1")).await;

            assert_eq!(store.mutation_calls(), (max_retries + 1) as usize);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_retry() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.fail_mutations(2);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 3);

        engine.execute("u-1", &approve("1")).await.unwrap();

        assert_eq!(store.mutation_calls(), 3);
        assert_eq!(cache.get_report("1").unwrap().status, ReportStatus::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_with_empty_reason_still_calls_store_and_rolls_back() {
        let store = Arc::new(MockReportStore::with_ids(&["7"]));
        store.fail_mutations(u32::MAX);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);
        let status_before = cache.get_report("7").unwrap().status;

        let decline = MutationRequest::new(
            "7",
            MutationPayload::Decline(DeclineRequest {
                approved_by: "u1".to_string(),
                reason: String::new(),
            }),
        );
        assert!(engine.execute("u-7", &decline).await.is_err());

        assert_eq!(store.mutation_calls(), 1);
        assert_eq!(cache.get_report("7").unwrap().status, status_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_from_list_before_network_settles() {
        let store = Arc::new(MockReportStore::with_ids(&["1", "2", "3"]));
        store.set_mutation_delay(Duration::from_millis(500));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute("u-del", &MutationRequest::new("2", MutationPayload::Delete))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let list = cache.get_list(&ReportFilters::default()).unwrap();
        let ids: Vec<&str> = list.data.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(list.pagination.total, 2);
        assert_eq!(store.mutation_calls(), 1);

        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delete_invalidates_instead_of_restoring() {
        let store = Arc::new(MockReportStore::with_ids(&["1", "2"]));
        store.fail_mutations(u32::MAX);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let result = engine
            .execute("u-del", &MutationRequest::new("2", MutationPayload::Delete))
            .await;

        assert!(result.is_err());
        assert!(cache.get_report("2").is_none());
        assert!(cache.is_list_stale(&ReportFilters::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_reapplies_patch_over_unchanged_server_copy() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_secs(5));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-1", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A poll lands with the untouched server copy
        cache.set_list(ReportFilters::default(), store.page());
        let conflicts = engine.reconcile(&snapshot_of(&store.page().data));

        assert!(conflicts.is_empty());
        assert_eq!(cache.get_report("1").unwrap().status, ReportStatus::Approved);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_wins_conflict_absorbs_update() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_secs(5));
        store.fail_mutations(u32::MAX);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-1", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let changed = store.server_edit("1", |r| r.status = ReportStatus::Forwarded);
        cache.set_list(ReportFilters::default(), store.page());
        let conflicts = engine.reconcile(&snapshot_of(&store.page().data));

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Status);
        assert_eq!(conflicts[0].resolved_with, Some(ConflictChoice::UseServer));
        assert_eq!(cache.get_report("1").unwrap(), changed);
        assert!(!engine.has_pending_update("u-1"));

        // The late failure must not roll back over the adopted server data
        assert!(task.await.unwrap().is_err());
        assert_eq!(cache.get_report("1").unwrap(), changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompted_conflict_waits_for_user_choice() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_secs(5));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::PromptUser, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let update = MutationRequest::new(
                    "1",
                    MutationPayload::Update(ReportPatch {
                        total_collected: Some(500.0),
                        ..Default::default()
                    }),
                );
                engine.execute("u-1", &update).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.server_edit("1", |r| r.total_collected = 250.0);
        cache.set_list(ReportFilters::default(), store.page());
        let detected = engine.reconcile(&snapshot_of(&store.page().data));

        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].conflict_type, ConflictType::Version);
        assert_eq!(detected[0].resolved_with, None);
        assert_eq!(engine.conflicts().len(), 1);
        // Local intent stays visible while the user decides
        assert_eq!(cache.get_report("1").unwrap().total_collected, 500.0);

        engine.resolve_conflict(0, ConflictChoice::UseServer).unwrap();
        assert!(engine.conflicts().is_empty());
        assert_eq!(cache.get_report("1").unwrap().total_collected, 250.0);
        assert!(matches!(
            engine.resolve_conflict(0, ConflictChoice::UseLocal),
            Err(SyncError::ConflictNotFound(_))
        ));

        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompted_conflict_superseded_by_agreeing_snapshot() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_secs(5));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::PromptUser, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-1", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.server_edit("1", |r| r.remarks = Some("touched".to_string()));
        cache.set_list(ReportFilters::default(), store.page());
        engine.reconcile(&snapshot_of(&store.page().data));
        assert_eq!(engine.conflicts().len(), 1);

        store.server_edit("1", |r| {
            r.status = ReportStatus::Approved;
            r.approved_by = Some("u1".to_string());
        });
        cache.set_list(ReportFilters::default(), store.page());
        engine.reconcile(&snapshot_of(&store.page().data));
        assert!(engine.conflicts().is_empty());

        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_keeps_local_metrics_and_server_status() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_secs(5));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::Merge, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let update = MutationRequest::new(
                    "1",
                    MutationPayload::Update(ReportPatch {
                        loans_disbursed: Some(12),
                        status: Some(ReportStatus::Submitted),
                        ..Default::default()
                    }),
                );
                engine.execute("u-1", &update).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.server_edit("1", |r| r.status = ReportStatus::Approved);
        cache.set_list(ReportFilters::default(), store.page());
        engine.reconcile(&snapshot_of(&store.page().data));

        let cached = cache.get_report("1").unwrap();
        assert_eq!(cached.status, ReportStatus::Approved);
        assert_eq!(cached.loans_disbursed, 12);

        // A later poll with the same server copy keeps the merged view
        cache.set_list(ReportFilters::default(), store.page());
        assert!(engine.reconcile(&snapshot_of(&store.page().data)).is_empty());
        let cached = cache.get_report("1").unwrap();
        assert_eq!(cached.status, ReportStatus::Approved);
        assert_eq!(cached.loans_disbursed, 12);

        task.await.unwrap().unwrap();
    }

    fn remarks(report_id: &str, text: &str) -> MutationRequest {
        MutationRequest::new(
            report_id,
            MutationPayload::Update(ReportPatch {
                remarks: Some(text.to_string()),
                ..Default::default()
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stacked_failures_keep_the_other_patch() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.fail_mutations(u32::MAX);
        store.push_mutation_delay(Duration::from_millis(100));
        store.push_mutation_delay(Duration::from_millis(300));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);
        let before = cache.get_report("1").unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-a", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-b", &remarks("1", "recounted")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cached = cache.get_report("1").unwrap();
        assert_eq!(cached.status, ReportStatus::Approved);
        assert_eq!(cached.remarks.as_deref(), Some("recounted"));

        assert!(first.await.unwrap().is_err());
        let cached = cache.get_report("1").unwrap();
        assert_eq!(cached.status, ReportStatus::Pending);
        assert_eq!(cached.remarks.as_deref(), Some("recounted"));
        assert_eq!(engine.pending_updates().len(), 1);

        assert!(second.await.unwrap().is_err());
        assert_eq!(cache.get_report("1").unwrap(), before);
        assert!(engine.pending_updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_update_keeps_later_patch_visible() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.push_mutation_delay(Duration::from_millis(100));
        store.set_mutation_delay(Duration::from_secs(5));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-a", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-b", &remarks("1", "recounted")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let confirmed = first.await.unwrap().unwrap().unwrap();
        let cached = cache.get_report("1").unwrap();
        assert_eq!(cached.status, ReportStatus::Approved);
        assert_eq!(cached.updated_at, confirmed.updated_at);
        assert_eq!(cached.remarks.as_deref(), Some("recounted"));
        assert_eq!(engine.pending_updates()[0].timestamp, confirmed.updated_at);

        // Our own confirmed version is not a conflict for the later update
        cache.set_list(ReportFilters::default(), store.page());
        assert!(engine.reconcile(&snapshot_of(&store.page().data)).is_empty());
        assert!(engine.has_pending_update("u-b"));
        assert_eq!(cache.get_report("1").unwrap().remarks.as_deref(), Some("recounted"));

        second.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_keeps_newer_agreeing_server_copy() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_millis(500));
        store.fail_mutations(u32::MAX);
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-1", &remarks("1", "recounted")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let edited = store.server_edit("1", |r| {
            r.remarks = Some("recounted".to_string());
            r.clients_served = 20;
        });
        cache.set_list(ReportFilters::default(), store.page());
        assert!(engine.reconcile(&snapshot_of(&store.page().data)).is_empty());

        assert!(task.await.unwrap().is_err());
        assert_eq!(cache.get_report("1").unwrap(), edited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_update_ignores_late_success() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        store.set_mutation_delay(Duration::from_millis(500));
        let (engine, cache) = engine_with(store.clone(), ConflictStrategy::UseServer, 0);
        let before = cache.get_report("1").unwrap();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute("u-1", &approve("1")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(engine.abandon("u-1"));
        assert!(!engine.abandon("u-1"));
        assert_eq!(cache.get_report("1").unwrap(), before);

        assert!(task.await.unwrap().is_ok());
        assert_eq!(cache.get_report("1").unwrap(), before);
        assert!(cache.is_list_stale(&ReportFilters::default()));
    }

    #[test]
    fn test_known_version_is_server_time() {
        let store = Arc::new(MockReportStore::with_ids(&["1"]));
        let cache = QueryCache::default();
        cache.set_list(ReportFilters::default(), store.page());
        let engine = OptimisticEngine::new(store, cache, ConflictResolver::default(), RetryPolicy::default());

        assert_eq!(engine.known_version("1"), Some(crate::test_support::base_time()));
        assert_eq!(engine.known_version("9"), None);
    }

    #[test]
    fn test_update_ids_are_unique() {
        let a = OptimisticEngine::update_id(MutationKind::Approve, "1");
        let b = OptimisticEngine::update_id(MutationKind::Approve, "1");
        assert_ne!(a, b);
        assert!(a.starts_with("approve-1-"));
    }
}
