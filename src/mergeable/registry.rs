//! Process-wide registry of record/table mappings.
//!
//! SQL sources and destinations need to know how a record type maps onto table
//! columns. Mappings are registered once per type and looked up by [`TypeId`] from a
//! mutex-guarded global map, so concurrent pipelines share the same metadata.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::concurrency::hold;
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::types::TableRow;

/// Column mapping for a record type.
///
/// Bundles the ordered column names with the conversions between the record type and
/// the positional [`TableRow`] the SQL clients exchange. Rows produced by `to_row`
/// must order cells exactly like `columns`.
pub struct RecordMapping<T> {
    columns: Vec<String>,
    to_row: Box<dyn Fn(&T) -> TableRow + Send + Sync>,
    from_row: Box<dyn Fn(&TableRow) -> FlowResult<T> + Send + Sync>,
}

impl<T> RecordMapping<T> {
    pub fn new(
        columns: Vec<String>,
        to_row: impl Fn(&T) -> TableRow + Send + Sync + 'static,
        from_row: impl Fn(&TableRow) -> FlowResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            columns,
            to_row: Box::new(to_row),
            from_row: Box::new(from_row),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn to_row(&self, record: &T) -> TableRow {
        (self.to_row)(record)
    }

    pub fn from_row(&self, row: &TableRow) -> FlowResult<T> {
        (self.from_row)(row)
    }
}

impl<T> std::fmt::Debug for RecordMapping<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordMapping")
            .field("type", &type_name::<T>())
            .field("columns", &self.columns)
            .finish()
    }
}

type MappingMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

fn registry() -> &'static Mutex<MappingMap> {
    static REGISTRY: OnceLock<Mutex<MappingMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers the mapping for `T`, replacing any previous registration.
pub fn register_mapping<T: Send + Sync + 'static>(mapping: RecordMapping<T>) {
    let mut map = hold(registry());
    map.insert(TypeId::of::<T>(), Arc::new(Arc::new(mapping)));
}

/// Looks up the registered mapping for `T`.
pub fn mapping_of<T: Send + Sync + 'static>() -> FlowResult<Arc<RecordMapping<T>>> {
    let map = hold(registry());

    let entry = map.get(&TypeId::of::<T>()).ok_or_else(|| {
        flow_error!(
            ErrorKind::MissingMapping,
            "No table mapping registered for record type",
            type_name::<T>()
        )
    })?;

    let mapping = entry
        .downcast_ref::<Arc<RecordMapping<T>>>()
        .ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidState,
                "Registered mapping has unexpected type",
                type_name::<T>()
            )
        })?;

    Ok(mapping.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cell;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        id: i64,
        label: String,
    }

    fn widget_mapping() -> RecordMapping<Widget> {
        RecordMapping::new(
            vec!["id".to_owned(), "label".to_owned()],
            |widget: &Widget| {
                TableRow::new(vec![
                    Cell::I64(widget.id),
                    Cell::String(widget.label.clone()),
                ])
            },
            |row: &TableRow| {
                let id = match row.get(0) {
                    Some(Cell::I64(value)) => *value,
                    other => {
                        return Err(flow_error!(
                            ErrorKind::ConversionError,
                            "Expected integer id column",
                            format!("{other:?}")
                        ));
                    }
                };
                let label = match row.get(1) {
                    Some(Cell::String(value)) => value.clone(),
                    other => {
                        return Err(flow_error!(
                            ErrorKind::ConversionError,
                            "Expected text label column",
                            format!("{other:?}")
                        ));
                    }
                };

                Ok(Widget { id, label })
            },
        )
    }

    #[test]
    fn lookup_without_registration_fails() {
        struct Unregistered;

        let err = mapping_of::<Unregistered>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingMapping);
    }

    #[test]
    fn registered_mapping_round_trips_records() {
        register_mapping(widget_mapping());

        let mapping = mapping_of::<Widget>().unwrap();
        assert_eq!(mapping.columns(), &["id".to_owned(), "label".to_owned()]);

        let widget = Widget {
            id: 7,
            label: "bolt".to_owned(),
        };
        let row = mapping.to_row(&widget);
        assert_eq!(mapping.from_row(&row).unwrap(), widget);
    }
}
