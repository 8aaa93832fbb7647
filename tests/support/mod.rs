#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use mergeflow::error::ErrorKind;
use mergeflow::flow_error;
use mergeflow::mergeable::{ChangeTracker, Mergeable, RecordMapping};
use mergeflow::sql::{MemoryDb, TableIdentity};
use mergeflow::types::{Cell, ChangeAction, TableRow};

/// Canonical test record: identified by `id`, compared by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub change: ChangeTracker,
}

pub fn customer(id: i64, name: &str) -> Customer {
    Customer {
        id,
        name: name.to_owned(),
        change: ChangeTracker::default(),
    }
}

impl Mergeable for Customer {
    fn id_values(&self) -> Vec<Cell> {
        vec![Cell::I64(self.id)]
    }

    fn comparable_values(&self) -> Vec<Cell> {
        vec![Cell::String(self.name.clone())]
    }

    fn change(&self) -> &ChangeTracker {
        &self.change
    }

    fn change_mut(&mut self) -> &mut ChangeTracker {
        &mut self.change
    }
}

pub fn customer_mapping() -> RecordMapping<Customer> {
    RecordMapping::new(
        vec!["id".to_owned(), "name".to_owned()],
        |customer: &Customer| {
            TableRow::new(vec![
                Cell::I64(customer.id),
                Cell::String(customer.name.clone()),
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
            let name = match row.get(1) {
                Some(Cell::String(value)) => value.clone(),
                other => {
                    return Err(flow_error!(
                        ErrorKind::ConversionError,
                        "Expected text name column",
                        format!("{other:?}")
                    ));
                }
            };

            Ok(Customer {
                id,
                name,
                change: ChangeTracker::default(),
            })
        },
    )
}

pub fn customers_table() -> TableIdentity {
    TableIdentity::new("customers", vec!["id".to_owned()]).unwrap()
}

/// Builds a database with a seeded customers table described by `identity`.
pub async fn customer_db(identity: &TableIdentity, rows: &[(i64, &str)]) -> MemoryDb {
    let db = MemoryDb::new();
    db.create_table(identity.clone(), vec!["id".to_owned(), "name".to_owned()])
        .await;

    let rows: Vec<TableRow> = rows
        .iter()
        .map(|(id, name)| {
            TableRow::new(vec![Cell::I64(*id), Cell::String((*name).to_owned())])
        })
        .collect();
    db.insert_rows(identity.name(), rows).await.unwrap();

    db
}

/// Snapshot of a customers table as sorted `(id, name)` pairs.
pub async fn customer_pairs(db: &MemoryDb, table: &str) -> Vec<(i64, String)> {
    let mut pairs: Vec<(i64, String)> = db
        .table_rows(table)
        .await
        .unwrap()
        .iter()
        .map(|row| match (row.get(0), row.get(1)) {
            (Some(Cell::I64(id)), Some(Cell::String(name))) => (*id, name.clone()),
            other => panic!("unexpected row shape: {other:?}"),
        })
        .collect();
    pairs.sort();

    pairs
}

/// Reduces a change set to `(id, action)` pairs in emission order.
pub fn actions(delta: &[Customer]) -> Vec<(i64, ChangeAction)> {
    delta
        .iter()
        .map(|customer| (customer.id, customer.action().expect("record not classified")))
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
