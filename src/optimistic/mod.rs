//! Optimistic updates
//!
//! Applies report mutations to the cache before the server answers, and
//! reconciles them with the server's copy afterwards.

mod conflict;
mod engine;
mod types;

pub use conflict::{detect_conflict, detect_conflict_type, ConflictResolver, ConflictWinner, ResolvedConflict};
pub use engine::OptimisticEngine;
pub use types::{
    Conflict, ConflictChoice, ConflictStrategy, ConflictType, DetectedConflict, MutationKind,
    MutationPayload, MutationRequest, OptimisticUpdate, RetryPolicy,
};
