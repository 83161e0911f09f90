//! Concurrency coordinator
//!
//! Accepts mutation requests, runs at most `max_concurrent_updates` of them
//! at once in FIFO admission order, and bounds each with `update_timeout`.
//! Execution itself is delegated to the optimistic engine.
//!
//! A timed-out item is marked failed right away and the engine rolls its
//! patch back. The store call keeps running detached; its late result never
//! changes the item's status or the cache.
//!
//! Admission spawns Tokio tasks, so every mutating call must happen inside a
//! Tokio runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use super::types::{QueueItemStatus, UpdateQueueItem};
use crate::config::UpdateConfig;
use crate::error::{Result, SyncError};
use crate::optimistic::{ConflictStrategy, MutationPayload, OptimisticEngine};
use crate::polling::{SnapshotListener, SnapshotUpdate};
use crate::reports::Report;

/// Coordinator handle
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    engine: OptimisticEngine,
    config: UpdateConfig,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    queue: Vec<UpdateQueueItem>,
    /// Ids of items in `processing`, in admission order
    processing: Vec<String>,
    /// Terminal error message per item id
    errors: HashMap<String, String>,
    /// Supervisor task per processing item
    tasks: HashMap<String, AbortHandle>,
    /// Items whose timed-out execution is still running
    detached: HashSet<String>,
}

impl UpdateCoordinator {
    pub fn new(engine: OptimisticEngine, config: UpdateConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn engine(&self) -> &OptimisticEngine {
        &self.inner.engine
    }

    fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent_updates.max(1)
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Enqueue a mutation and return its id without waiting for it to run
    ///
    /// The item remembers the server version of the report it was queued
    /// against. Panics outside a Tokio runtime.
    pub fn queue_update(&self, report_id: impl Into<String>, payload: MutationPayload) -> String {
        let report_id = report_id.into();
        let base_version = self.inner.engine.known_version(&report_id);
        let item = UpdateQueueItem::new(report_id, payload, base_version);
        let id = item.id.clone();

        tracing::debug!(
            update_id = %id,
            report_id = %item.report_id,
            kind = %item.kind,
            "Update queued"
        );
        self.inner.state.lock().queue.push(item);

        self.drain();
        id
    }

    /// Admit pending items until the concurrency ceiling is reached
    fn drain(&self) {
        while self.process_next_update().is_some() {}
    }

    /// Admit the first pending item, if below the concurrency ceiling
    ///
    /// Returns the admitted item's id. An item whose timed-out execution is
    /// still running waits for it.
    pub fn process_next_update(&self) -> Option<String> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.processing.len() >= self.max_concurrent() {
            return None;
        }

        let processing = &state.processing;
        let detached = &state.detached;
        let item = state.queue.iter_mut().find(|item| {
            item.status == QueueItemStatus::Pending
                && !processing.contains(&item.id)
                && !detached.contains(&item.id)
        })?;

        item.status = QueueItemStatus::Processing;
        let item = item.clone();
        state.processing.push(item.id.clone());

        tracing::info!(
            update_id = %item.id,
            report_id = %item.report_id,
            kind = %item.kind,
            attempt = item.retry_count + 1,
            status = %item.status,
            "Update admitted"
        );

        let id = item.id.clone();
        let coordinator = self.clone();
        let task = tokio::spawn(async move { coordinator.run_item(item).await });
        state.tasks.insert(id.clone(), task.abort_handle());
        Some(id)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn run_item(self, item: UpdateQueueItem) {
        let engine = self.inner.engine.clone();
        let request = item.request();
        let update_id = item.id.clone();
        let mut execution = tokio::spawn(async move { engine.execute(&update_id, &request).await });

        let joined = tokio::select! {
            joined = &mut execution => Some(joined),
            _ = tokio::time::sleep(self.inner.config.update_timeout) => None,
        };

        let outcome = match joined {
            Some(joined) => joined.map_err(SyncError::from).and_then(|result| result),
            None => {
                tracing::warn!(
                    update_id = %item.id,
                    report_id = %item.report_id,
                    timeout_ms = self.inner.config.update_timeout.as_millis() as u64,
                    "Update timed out"
                );
                self.inner.engine.abandon(&item.id);
                self.detach(item.id.clone(), execution);
                Err(SyncError::Timeout)
            }
        };

        self.settle(&item.id, outcome);
    }

    /// Let a timed-out execution finish in the background
    fn detach(&self, update_id: String, execution: JoinHandle<Result<Option<Report>>>) {
        self.inner.state.lock().detached.insert(update_id.clone());
        let coordinator = self.clone();
        tokio::spawn(async move {
            match execution.await {
                Ok(Ok(_)) => {
                    tracing::info!(update_id = %update_id, "Ignoring late success after timeout")
                }
                Ok(Err(e)) => {
                    tracing::info!(update_id = %update_id, error = %e, "Ignoring late failure after timeout")
                }
                Err(e) => {
                    tracing::error!(update_id = %update_id, error = %e, "Detached update task failed")
                }
            }
            coordinator.inner.state.lock().detached.remove(&update_id);
            // A requeued item may have been waiting for this execution to settle
            coordinator.drain();
        });
    }

    fn settle(&self, update_id: &str, outcome: Result<Option<Report>>) {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.processing.retain(|id| id != update_id);
            state.tasks.remove(update_id);

            let retry_limit = self.inner.config.queue_retry_limit;
            match state.queue.iter_mut().find(|item| item.id == update_id) {
                None => {
                    tracing::debug!(update_id = %update_id, "Settled update is no longer queued");
                }
                Some(item) if item.status != QueueItemStatus::Processing => {
                    tracing::debug!(
                        update_id = %update_id,
                        status = %item.status,
                        "Ignoring result for settled update"
                    );
                }
                Some(item) => match outcome {
                    Ok(_) => {
                        item.status = QueueItemStatus::Completed;
                        state.errors.remove(update_id);
                        tracing::info!(
                            update_id = %update_id,
                            report_id = %item.report_id,
                            status = %item.status,
                            "Update completed"
                        );
                    }
                    Err(e) if !e.is_not_found() && item.retry_count < retry_limit => {
                        item.retry_count += 1;
                        item.status = QueueItemStatus::Pending;
                        tracing::warn!(
                            update_id = %update_id,
                            report_id = %item.report_id,
                            attempt = item.retry_count,
                            error = %e,
                            "Update failed, requeued"
                        );
                    }
                    Err(e) => {
                        item.status = QueueItemStatus::Failed;
                        tracing::error!(
                            update_id = %update_id,
                            report_id = %item.report_id,
                            status = %item.status,
                            error = %e,
                            "Update failed"
                        );
                        state.errors.insert(update_id.to_string(), e.to_string());
                    }
                },
            }
        }

        self.drain();
    }

    // ========================================================================
    // Caller actions
    // ========================================================================

    /// Put a failed item back to `pending` with its retry count cleared
    pub fn retry_failed_update(&self, update_id: &str) -> Result<()> {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let item = state
                .queue
                .iter_mut()
                .find(|item| item.id == update_id && item.status == QueueItemStatus::Failed)
                .ok_or_else(|| SyncError::UpdateNotFound(update_id.to_string()))?;

            item.status = QueueItemStatus::Pending;
            item.retry_count = 0;
            state.errors.remove(update_id);
            tracing::info!(update_id = %update_id, report_id = %item.report_id, "Retrying failed update");
        }

        self.drain();
        Ok(())
    }

    /// Drop every queued item, processing marker, timeout and recorded error
    ///
    /// Executions already handed to the engine still finish their own
    /// confirmation or rollback.
    pub fn clear_queue(&self) {
        let mut state = self.inner.state.lock();
        for (_, task) in state.tasks.drain() {
            task.abort();
        }
        let dropped = state.queue.len();
        state.queue.clear();
        state.processing.clear();
        state.errors.clear();
        tracing::info!(dropped, "Update queue cleared");
    }

    // ========================================================================
    // Conflict bridging
    // ========================================================================

    /// Cancel pending items for reports the server changed after they were queued
    ///
    /// Only applies under the server-wins strategy. "After" is judged on the
    /// server's `updated_at` alone. Items already processing are left to the
    /// engine's own conflict check.
    fn cancel_superseded(&self, update: &SnapshotUpdate) {
        if self.inner.config.conflict_resolution != ConflictStrategy::UseServer || !update.advanced() {
            return;
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let processing = &state.processing;
        state.queue.retain(|item| {
            let superseded = item.status == QueueItemStatus::Pending
                && !processing.contains(&item.id)
                && update
                    .changed_report(&item.report_id)
                    .is_some_and(|server| item.is_superseded_by(server));
            if superseded {
                tracing::info!(
                    update_id = %item.id,
                    report_id = %item.report_id,
                    kind = %item.kind,
                    "Cancelled pending update superseded by server data"
                );
            }
            !superseded
        });
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn update_queue(&self) -> Vec<UpdateQueueItem> {
        self.inner.state.lock().queue.clone()
    }

    pub fn processing_updates(&self) -> Vec<String> {
        self.inner.state.lock().processing.clone()
    }

    pub fn update_errors(&self) -> HashMap<String, String> {
        self.inner.state.lock().errors.clone()
    }

    pub fn has_failed_updates(&self) -> bool {
        let state = self.inner.state.lock();
        state
            .queue
            .iter()
            .any(|item| item.status == QueueItemStatus::Failed)
    }

    pub fn item(&self, update_id: &str) -> Option<UpdateQueueItem> {
        let state = self.inner.state.lock();
        state.queue.iter().find(|item| item.id == update_id).cloned()
    }
}

impl SnapshotListener for UpdateCoordinator {
    fn on_snapshot(&self, update: &SnapshotUpdate) {
        self.cancel_superseded(update);
        self.inner.engine.reconcile(update);
    }
}
