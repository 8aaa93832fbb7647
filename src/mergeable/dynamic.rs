//! Schemaless records described at runtime.
//!
//! [`DynamicRow`] carries its values positionally and resolves names through a shared
//! [`DynamicSchema`], so pipelines can move records whose shape is only known at
//! runtime while still participating in merging.

use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::mergeable::{ChangeTracker, Mergeable, RecordMapping};
use crate::types::{Cell, ChangeAction, TableRow};

/// Runtime description of a dynamic record shape.
///
/// Declares the ordered column names, which columns form the identity, which are
/// compared for change detection, and optional delete markers: `(column, value)`
/// pairs that flag a row for deletion when every pair matches.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicSchema {
    columns: Vec<String>,
    id_columns: Vec<String>,
    compare_columns: Vec<String>,
    delete_markers: Vec<(String, Cell)>,
}

impl DynamicSchema {
    /// Creates a schema where every column is comparable and none is identity.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            compare_columns: columns.clone(),
            columns,
            id_columns: Vec::new(),
            delete_markers: Vec::new(),
        }
    }

    /// Declares the identity columns, removing them from the comparable set.
    pub fn with_id_columns(mut self, id_columns: Vec<String>) -> Self {
        self.compare_columns
            .retain(|column| !id_columns.contains(column));
        self.id_columns = id_columns;
        self
    }

    /// Overrides the comparable columns.
    pub fn with_compare_columns(mut self, compare_columns: Vec<String>) -> Self {
        self.compare_columns = compare_columns;
        self
    }

    /// Adds a delete marker pair.
    pub fn with_delete_marker(mut self, column: impl Into<String>, value: Cell) -> Self {
        self.delete_markers.push((column.into(), value));
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn id_columns(&self) -> &[String] {
        &self.id_columns
    }

    /// Returns the position of a column, if declared.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|name| name == column)
    }

    /// Builds the table mapping for rows of this schema.
    pub fn mapping(self: &Arc<Self>) -> RecordMapping<DynamicRow> {
        let schema = self.clone();

        RecordMapping::new(
            self.columns.clone(),
            |row: &DynamicRow| TableRow::new(row.values.clone()),
            move |row: &TableRow| DynamicRow::new(schema.clone(), row.values().to_vec()),
        )
    }
}

/// A record whose shape is described by a [`DynamicSchema`].
#[derive(Debug, Clone)]
pub struct DynamicRow {
    schema: Arc<DynamicSchema>,
    values: Vec<Cell>,
    change: ChangeTracker,
}

impl DynamicRow {
    /// Creates a row, validating that the value count matches the schema.
    pub fn new(schema: Arc<DynamicSchema>, values: Vec<Cell>) -> FlowResult<Self> {
        if values.len() != schema.columns.len() {
            return Err(flow_error!(
                ErrorKind::InvalidData,
                "Row value count does not match schema",
                format!(
                    "expected {} values, got {}",
                    schema.columns.len(),
                    values.len()
                )
            ));
        }

        Ok(Self {
            schema,
            values,
            change: ChangeTracker::default(),
        })
    }

    pub fn schema(&self) -> &Arc<DynamicSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[Cell] {
        &self.values
    }

    /// Returns the value of a named column.
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.schema
            .index_of(column)
            .and_then(|index| self.values.get(index))
    }

    /// Replaces the value of a named column.
    pub fn set(&mut self, column: &str, value: Cell) -> FlowResult<()> {
        let index = self.schema.index_of(column).ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidData,
                "Column not declared in schema",
                column.to_owned()
            )
        })?;

        self.values[index] = value;
        Ok(())
    }

    fn values_for(&self, columns: &[String]) -> Vec<Cell> {
        columns
            .iter()
            .filter_map(|column| self.get(column).cloned())
            .collect()
    }
}

impl PartialEq for DynamicRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Mergeable for DynamicRow {
    fn id_values(&self) -> Vec<Cell> {
        self.values_for(&self.schema.id_columns)
    }

    fn comparable_values(&self) -> Vec<Cell> {
        self.values_for(&self.schema.compare_columns)
    }

    fn change(&self) -> &ChangeTracker {
        &self.change
    }

    fn change_mut(&mut self) -> &mut ChangeTracker {
        &mut self.change
    }

    fn set_change_action(&mut self) {
        if self.schema.delete_markers.is_empty() {
            return;
        }

        let doomed = self
            .schema
            .delete_markers
            .iter()
            .all(|(column, value)| self.get(column) == Some(value));

        if doomed {
            self.change_mut().set(Some(ChangeAction::Delete));
        }
    }
}

impl Serialize for DynamicRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.schema.columns.iter().zip(self.values.iter()) {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}
