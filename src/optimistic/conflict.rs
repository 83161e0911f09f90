//! Conflict detection and resolution
//!
//! Classifies disagreements between an optimistic update and a newer server
//! copy of the same report, and computes the data each resolution leaves in
//! the cache.

use crate::reports::Report;

use super::types::{ConflictChoice, ConflictStrategy, ConflictType, OptimisticUpdate};

/// Classify a conflict
///
/// A status difference always wins over any other difference.
pub fn detect_conflict_type(update: &OptimisticUpdate, server: &Report) -> ConflictType {
    if update.original_data.status != server.status {
        ConflictType::Status
    } else if server.updated_at > update.timestamp {
        ConflictType::Version
    } else {
        ConflictType::Data
    }
}

/// Whether a server copy is in conflict with an update
///
/// Only server copies newer than the update can conflict, and a newer copy
/// that already carries every patched value is agreement, not conflict.
pub fn detect_conflict(update: &OptimisticUpdate, server: &Report) -> Option<ConflictType> {
    if server.updated_at <= update.timestamp {
        return None;
    }

    let disagrees = match &update.patch {
        Some(patch) => !patch.changed_fields(server).is_empty(),
        // The report is still there after someone else touched it
        None => true,
    };

    disagrees.then(|| detect_conflict_type(update, server))
}

/// Conflict resolver with a configurable default strategy
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Compute the report a choice leaves behind
    pub fn resolve(
        &self,
        choice: ConflictChoice,
        update: &OptimisticUpdate,
        server: &Report,
    ) -> ResolvedConflict {
        match (choice, &update.patch) {
            (ConflictChoice::UseServer, _) => ResolvedConflict {
                winner: ConflictWinner::Server,
                data: Some(server.clone()),
                patch: None,
            },
            (ConflictChoice::UseLocal, Some(patch)) => ResolvedConflict {
                winner: ConflictWinner::Local,
                data: Some(patch.apply_to(server)),
                patch: Some(patch.clone()),
            },
            (ConflictChoice::Merge, Some(patch)) => {
                let editable = patch.user_editable();
                ResolvedConflict {
                    winner: ConflictWinner::Merged,
                    data: Some(editable.apply_to(server)),
                    patch: Some(editable),
                }
            }
            // A delete has no fields to merge; keeping the local side keeps the removal
            (ConflictChoice::UseLocal | ConflictChoice::Merge, None) => ResolvedConflict {
                winner: ConflictWinner::Local,
                data: None,
                patch: None,
            },
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::UseServer)
    }
}

/// Result of conflict resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub winner: ConflictWinner,
    /// Report to write to the cache, `None` when the report stays removed
    pub data: Option<Report>,
    /// Patch the still-pending update keeps re-applying, `None` when the
    /// update is absorbed by the server side
    pub patch: Option<crate::reports::ReportPatch>,
}

/// Which side won the conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Server,
    Merged,
}
