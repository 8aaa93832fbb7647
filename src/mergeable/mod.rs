//! Record identity and change tracking for the merge engine.
//!
//! A record type participates in merging by implementing [`Mergeable`]: it declares
//! which of its values form the record's identity and which are compared for change
//! detection. The trait derives a stable string id, value equality without identity,
//! and a composite hash from those declarations.

mod dynamic;
mod registry;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use dynamic::{DynamicRow, DynamicSchema};
pub use registry::{RecordMapping, mapping_of, register_mapping};

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::types::{Cell, ChangeAction};

/// Tracks the merge classification of a record together with the time it was set.
///
/// The action and its timestamp always change together: [`ChangeTracker::set`] is the
/// only way to assign an action and it stamps the current time, so a record can never
/// carry an action without a matching change time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeTracker {
    action: Option<ChangeAction>,
    changed_at: Option<DateTime<Utc>>,
}

impl ChangeTracker {
    /// Returns the assigned action, if any.
    pub fn action(&self) -> Option<ChangeAction> {
        self.action
    }

    /// Returns the time the action was last assigned.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.changed_at
    }

    /// Assigns an action and stamps the current time. Clearing the action also clears
    /// the timestamp.
    pub fn set(&mut self, action: Option<ChangeAction>) {
        self.changed_at = action.map(|_| Utc::now());
        self.action = action;
    }
}

/// A record the merge engine can diff against a destination table.
///
/// Implementors supply the identity cells, the comparable cells, and access to an
/// embedded [`ChangeTracker`]; everything else is provided.
pub trait Mergeable: Clone + Send + Sync + 'static {
    /// Cells forming the record's identity, in a fixed declaration order.
    fn id_values(&self) -> Vec<Cell>;

    /// Cells compared for change detection. Identity cells are normally excluded.
    fn comparable_values(&self) -> Vec<Cell>;

    /// Read access to the embedded change tracker.
    fn change(&self) -> &ChangeTracker;

    /// Write access to the embedded change tracker.
    fn change_mut(&mut self) -> &mut ChangeTracker;

    /// Hook invoked once per record before classification.
    ///
    /// Implementations with delete semantics (soft-delete flags, tombstone markers)
    /// override this to pre-assign [`ChangeAction::Delete`]. The default leaves the
    /// record unclassified.
    fn set_change_action(&mut self) {}

    /// Returns the record's stable string identity.
    ///
    /// The identity is the concatenation of the canonical text of each identity cell,
    /// without separators. Callers composing multi-cell identities should ensure cell
    /// texts cannot collide across boundaries. An identity that renders empty or
    /// whitespace-only is an error.
    fn id(&self) -> FlowResult<String> {
        let values = self.id_values();
        let id: String = values.iter().map(Cell::to_sql_text).collect();

        if id.trim().is_empty() {
            return Err(flow_error!(
                ErrorKind::InvalidRecordId,
                "Record identity rendered empty",
                format!("identity cells: {values:?}")
            ));
        }

        Ok(id)
    }

    /// Returns the assigned change action, if any.
    fn action(&self) -> Option<ChangeAction> {
        self.change().action()
    }

    /// Assigns a change action, stamping the change time.
    fn set_action(&mut self, action: Option<ChangeAction>) {
        self.change_mut().set(action);
    }

    /// Compares the non-identity values of two records.
    fn equals_without_id(&self, other: &Self) -> bool {
        self.comparable_values() == other.comparable_values()
    }

    /// Composite hash over identity and comparable values.
    ///
    /// The identity and comparable halves are hashed independently and combined with
    /// XOR, so the hash changes whenever either half changes.
    fn merge_hash(&self) -> u64 {
        combine_cell_hashes(&self.id_values()) ^ combine_cell_hashes(&self.comparable_values())
    }
}

/// Combines per-cell hashes into one value, sensitive to element order.
pub fn combine_cell_hashes(values: &[Cell]) -> u64 {
    // FNV-1a style fold over the individual cell hashes.
    values.iter().fold(0xcbf2_9ce4_8422_2325_u64, |acc, cell| {
        let mut hasher = DefaultHasher::new();
        cell.hash(&mut hasher);
        (acc ^ hasher.finish()).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
