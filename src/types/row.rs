use serde::{Deserialize, Serialize};

use crate::types::Cell;

/// A positional row of cells, the generic exchange format for SQL clients.
///
/// Column names live in the [`RecordMapping`](crate::mergeable::RecordMapping) or
/// table metadata that produced the row; the row itself is purely positional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    values: Vec<Cell>,
}

impl TableRow {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Cell> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<Cell> {
        self.values
    }
}
