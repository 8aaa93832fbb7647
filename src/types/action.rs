use serde::{Deserialize, Serialize};

/// Classification of a record produced by the merge engine.
///
/// An unclassified record is represented as `Option<ChangeAction>::None` on the
/// record's change tracker; `ChangeAction::None` means the record was compared and
/// found identical to its destination counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    /// Present on both sides with equal non-identity values.
    None,
    /// Present only in the incoming stream.
    Insert,
    /// Present on both sides with differing non-identity values.
    Update,
    /// Present only in the destination, or explicitly flagged for removal.
    Delete,
}

impl ChangeAction {
    /// Returns true for actions that end up as a physical row in the destination.
    pub fn is_written(&self) -> bool {
        matches!(self, ChangeAction::Insert | ChangeAction::Update)
    }
}
