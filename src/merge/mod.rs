//! Diff-and-sync engine.
//!
//! [`Merge`] consumes a stream of [`Mergeable`](crate::mergeable::Mergeable)
//! records, reconciles it against a destination table, applies the necessary
//! inserts, updates, and deletes, and replays the resulting change set downstream
//! once the destination is fully written.

mod engine;

use serde::{Deserialize, Serialize};

pub use engine::Merge;

use crate::config::BatchConfig;

/// How the engine treats destination rows missing from the incoming stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    /// The stream is the complete desired state: missing destination rows are
    /// deleted during finalization.
    Full,
    /// Deletions are driven solely by records pre-flagged
    /// [`ChangeAction::Delete`](crate::types::ChangeAction::Delete); unmatched
    /// destination rows are left alone.
    Delta,
    /// Never infers deletions. Records are classified per batch against the
    /// destination and unmatched destination rows are left alone; records
    /// pre-flagged [`ChangeAction::Delete`](crate::types::ChangeAction::Delete)
    /// are still removed but stay out of the change set.
    NoDeletions,
}

/// Configuration of a [`Merge`] stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub mode: MergeMode,
    pub batch: BatchConfig,
    /// Prefer truncating the destination over targeted deletes. Only honored in
    /// [`MergeMode::Full`]; forced when the table declares no primary key.
    pub use_truncate: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::Full,
            batch: BatchConfig::default(),
            use_truncate: false,
        }
    }
}

impl MergeConfig {
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}
