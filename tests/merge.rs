mod support;

use std::sync::Arc;

use mergeflow::config::BatchConfig;
use mergeflow::destination::MemoryDestination;
use mergeflow::error::ErrorKind;
use mergeflow::merge::{Merge, MergeConfig, MergeMode};
use mergeflow::mergeable::{register_mapping, DynamicRow, DynamicSchema, Mergeable};
use mergeflow::pipeline::{FailedRecord, LinkSource};
use mergeflow::source::MemorySource;
use mergeflow::sql::{MemoryDb, TableIdentity};
use mergeflow::types::{Cell, ChangeAction, TableRow};

use support::{actions, customer, customer_db, customer_mapping, customer_pairs, customers_table, init_tracing, Customer};

async fn run_merge(merge: &Merge<Customer, MemoryDb>, source_rows: Vec<Customer>) {
    let source = MemorySource::new(source_rows);
    source.link_to(merge).unwrap();
    source.execute();
    merge.wait().await.unwrap();
}

#[tokio::test]
async fn full_merge_classifies_and_syncs() {
    init_tracing();

    let identity = customers_table();
    let db = customer_db(&identity, &[(1, "A"), (2, "B"), (10, "Z")]).await;
    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig::default(),
    )
    .unwrap();

    let replay: MemoryDestination<Customer> = MemoryDestination::new();
    merge.link_to(&replay).unwrap();

    run_merge(
        &merge,
        vec![customer(1, "A"), customer(2, "C"), customer(3, "D")],
    )
    .await;
    replay.wait().await.unwrap();

    // Batch-derived entries in input order, finalize-derived deletions after.
    let delta = merge.delta();
    assert_eq!(
        actions(&delta),
        vec![
            (1, ChangeAction::None),
            (2, ChangeAction::Update),
            (3, ChangeAction::Insert),
            (10, ChangeAction::Delete),
        ]
    );

    assert_eq!(
        customer_pairs(&db, "customers").await,
        vec![
            (1, "A".to_owned()),
            (2, "C".to_owned()),
            (3, "D".to_owned()),
        ]
    );

    assert_eq!(replay.rows().await, delta);
}

#[tokio::test]
async fn full_merge_is_idempotent() {
    init_tracing();

    let identity = customers_table();
    let db = customer_db(&identity, &[(1, "A"), (2, "B")]).await;
    let rows = vec![customer(1, "A"), customer(2, "C"), customer(3, "D")];

    let first = Merge::new(
        db.clone(),
        identity.clone(),
        Arc::new(customer_mapping()),
        MergeConfig::default(),
    )
    .unwrap();
    run_merge(&first, rows.clone()).await;

    let before = customer_pairs(&db, "customers").await;
    let second = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig::default(),
    )
    .unwrap();
    run_merge(&second, rows).await;

    assert_eq!(
        actions(&second.delta()),
        vec![
            (1, ChangeAction::None),
            (2, ChangeAction::None),
            (3, ChangeAction::None),
        ]
    );
    assert_eq!(customer_pairs(&db, "customers").await, before);
}

#[tokio::test]
async fn no_deletions_merge_leaves_unmatched_rows() {
    init_tracing();

    let identity = customers_table();
    let db = customer_db(&identity, &[(1, "A"), (2, "B"), (10, "Z")]).await;
    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig::new(MergeMode::NoDeletions),
    )
    .unwrap();

    run_merge(
        &merge,
        vec![customer(1, "A"), customer(2, "C"), customer(3, "D")],
    )
    .await;

    assert_eq!(
        actions(&merge.delta()),
        vec![
            (1, ChangeAction::None),
            (2, ChangeAction::Update),
            (3, ChangeAction::Insert),
        ]
    );

    // Row 10 was never part of the stream and must survive.
    assert_eq!(
        customer_pairs(&db, "customers").await,
        vec![
            (1, "A".to_owned()),
            (2, "C".to_owned()),
            (3, "D".to_owned()),
            (10, "Z".to_owned()),
        ]
    );
}

#[tokio::test]
async fn empty_stream_full_merge_clears_destination() {
    init_tracing();

    let identity = customers_table();
    let db = customer_db(&identity, &[(1, "A"), (2, "B"), (10, "Z")]).await;
    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig::default(),
    )
    .unwrap();

    run_merge(&merge, Vec::new()).await;

    assert_eq!(
        actions(&merge.delta()),
        vec![
            (1, ChangeAction::Delete),
            (2, ChangeAction::Delete),
            (10, ChangeAction::Delete),
        ]
    );
    assert!(customer_pairs(&db, "customers").await.is_empty());
}

#[tokio::test]
async fn full_merge_truncates_when_table_has_no_primary_key() {
    init_tracing();

    let identity = TableIdentity::new("customers", Vec::new()).unwrap();
    let db = customer_db(&identity, &[(1, "A"), (2, "B"), (10, "Z")]).await;
    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig::default(),
    )
    .unwrap();
    assert!(merge.use_truncate());

    run_merge(
        &merge,
        vec![customer(1, "A"), customer(2, "C"), customer(3, "D")],
    )
    .await;

    assert_eq!(
        actions(&merge.delta()),
        vec![
            (1, ChangeAction::None),
            (2, ChangeAction::Update),
            (3, ChangeAction::Insert),
            (10, ChangeAction::Delete),
        ]
    );

    // Truncation rewrites even unchanged rows.
    assert_eq!(
        customer_pairs(&db, "customers").await,
        vec![
            (1, "A".to_owned()),
            (2, "C".to_owned()),
            (3, "D".to_owned()),
        ]
    );
}

#[tokio::test]
async fn truncate_flag_is_ignored_outside_full_mode() {
    let identity = customers_table();
    let db = customer_db(&identity, &[]).await;

    let full = Merge::new(
        db.clone(),
        identity.clone(),
        Arc::new(customer_mapping()),
        MergeConfig {
            use_truncate: true,
            ..MergeConfig::default()
        },
    )
    .unwrap();
    assert!(full.use_truncate());

    let delta = Merge::new(
        db,
        identity,
        Arc::new(customer_mapping()),
        MergeConfig {
            use_truncate: true,
            ..MergeConfig::new(MergeMode::Delta)
        },
    )
    .unwrap();
    assert!(!delta.use_truncate());
}

#[tokio::test]
async fn merge_rejects_zero_batch_size() {
    let identity = customers_table();
    let db = customer_db(&identity, &[]).await;
    let err = Merge::<Customer, _>::new(
        db,
        identity,
        Arc::new(customer_mapping()),
        MergeConfig {
            batch: BatchConfig { max_size: 0 },
            ..MergeConfig::default()
        },
    )
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigError);
}

#[tokio::test]
async fn merge_builds_from_registered_mapping() {
    init_tracing();

    register_mapping(customer_mapping());

    let identity = customers_table();
    let db = customer_db(&identity, &[(1, "A")]).await;
    let merge: Merge<Customer, MemoryDb> =
        Merge::from_registry(db.clone(), identity, MergeConfig::default()).unwrap();

    run_merge(&merge, vec![customer(1, "B")]).await;

    assert_eq!(actions(&merge.delta()), vec![(1, ChangeAction::Update)]);
    assert_eq!(
        customer_pairs(&db, "customers").await,
        vec![(1, "B".to_owned())]
    );
}

fn order_schema() -> Arc<DynamicSchema> {
    Arc::new(
        DynamicSchema::new(vec![
            "id".to_owned(),
            "name".to_owned(),
            "deleted".to_owned(),
        ])
        .with_id_columns(vec!["id".to_owned()])
        .with_compare_columns(vec!["name".to_owned()])
        .with_delete_marker("deleted", Cell::Bool(true)),
    )
}

async fn order_db(identity: &TableIdentity, rows: &[(i64, &str, bool)]) -> MemoryDb {
    let db = MemoryDb::new();
    db.create_table(
        identity.clone(),
        vec!["id".to_owned(), "name".to_owned(), "deleted".to_owned()],
    )
    .await;

    let rows: Vec<TableRow> = rows
        .iter()
        .map(|(id, name, deleted)| {
            TableRow::new(vec![
                Cell::I64(*id),
                Cell::String((*name).to_owned()),
                Cell::Bool(*deleted),
            ])
        })
        .collect();
    db.insert_rows(identity.name(), rows).await.unwrap();

    db
}

fn order(schema: &Arc<DynamicSchema>, id: i64, name: &str, deleted: bool) -> DynamicRow {
    DynamicRow::new(
        schema.clone(),
        vec![
            Cell::I64(id),
            Cell::String(name.to_owned()),
            Cell::Bool(deleted),
        ],
    )
    .unwrap()
}

#[tokio::test]
async fn delta_merge_deletes_flagged_rows() {
    init_tracing();

    let schema = order_schema();
    let identity = TableIdentity::new("orders", vec!["id".to_owned()]).unwrap();
    let db = order_db(&identity, &[(1, "A", false), (2, "B", false)]).await;

    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(schema.mapping()),
        MergeConfig::new(MergeMode::Delta),
    )
    .unwrap();

    let source = MemorySource::new(vec![
        order(&schema, 2, "B2", false),
        order(&schema, 1, "A", true),
    ]);
    source.link_to(&merge).unwrap();
    source.execute();
    merge.wait().await.unwrap();

    // The flagged source row and the finalize-appended snapshot row both report the
    // deletion; the snapshot copy always comes last.
    let summary: Vec<(Option<Cell>, Option<ChangeAction>)> = merge
        .delta()
        .iter()
        .map(|row| (row.get("id").cloned(), row.action()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Some(Cell::I64(2)), Some(ChangeAction::Update)),
            (Some(Cell::I64(1)), Some(ChangeAction::Delete)),
            (Some(Cell::I64(1)), Some(ChangeAction::Delete)),
        ]
    );

    let rows = db.table_rows("orders").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(0), Some(&Cell::I64(2)));
    assert_eq!(rows[0].get(1), Some(&Cell::String("B2".to_owned())));
}

#[tokio::test]
async fn delta_merge_ignores_unmatched_destination_rows() {
    init_tracing();

    let schema = order_schema();
    let identity = TableIdentity::new("orders", vec!["id".to_owned()]).unwrap();
    let db = order_db(&identity, &[(1, "A", false), (9, "old", false)]).await;

    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(schema.mapping()),
        MergeConfig::new(MergeMode::Delta),
    )
    .unwrap();

    let source = MemorySource::new(vec![order(&schema, 1, "A1", false)]);
    source.link_to(&merge).unwrap();
    source.execute();
    merge.wait().await.unwrap();

    // Row 9 was absent from the stream but delta mode never infers deletions.
    let rows = db.table_rows("orders").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(merge.delta().len(), 1);
}

#[tokio::test]
async fn no_deletions_merge_applies_flagged_deletes() {
    init_tracing();

    let schema = order_schema();
    let identity = TableIdentity::new("orders", vec!["id".to_owned()]).unwrap();
    let db = order_db(
        &identity,
        &[(1, "A", false), (2, "B", false), (9, "old", false)],
    )
    .await;

    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(schema.mapping()),
        MergeConfig::new(MergeMode::NoDeletions),
    )
    .unwrap();

    let source = MemorySource::new(vec![
        order(&schema, 1, "A", true),
        order(&schema, 2, "B2", false),
    ]);
    source.link_to(&merge).unwrap();
    source.execute();
    merge.wait().await.unwrap();

    // The flagged delete is applied but never reported in the change set.
    let summary: Vec<(Option<Cell>, Option<ChangeAction>)> = merge
        .delta()
        .iter()
        .map(|row| (row.get("id").cloned(), row.action()))
        .collect();
    assert_eq!(
        summary,
        vec![(Some(Cell::I64(2)), Some(ChangeAction::Update))]
    );

    // Row 1 is gone; row 9 was absent from the stream and survives.
    let rows = db.table_rows("orders").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.get(0) != Some(&Cell::I64(1))));
    let unmatched = rows
        .iter()
        .find(|row| row.get(0) == Some(&Cell::I64(9)))
        .expect("row 9 still present");
    assert_eq!(unmatched.get(1), Some(&Cell::String("old".to_owned())));
}

#[tokio::test]
async fn merge_diverts_classification_failures() {
    init_tracing();

    let schema = Arc::new(
        DynamicSchema::new(vec!["code".to_owned(), "name".to_owned()])
            .with_id_columns(vec!["code".to_owned()]),
    );
    let identity = TableIdentity::new("products", vec!["code".to_owned()]).unwrap();
    let db = MemoryDb::new();
    db.create_table(identity.clone(), vec!["code".to_owned(), "name".to_owned()])
        .await;
    db.insert_rows(
        "products",
        vec![TableRow::new(vec![
            Cell::String("p1".to_owned()),
            Cell::String("A".to_owned()),
        ])],
    )
    .await
    .unwrap();

    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(schema.mapping()),
        MergeConfig::default(),
    )
    .unwrap();
    let failures: MemoryDestination<FailedRecord> = MemoryDestination::new();
    merge.link_errors_to(&failures).unwrap();

    let product = |code: &str, name: &str| {
        DynamicRow::new(
            schema.clone(),
            vec![Cell::String(code.to_owned()), Cell::String(name.to_owned())],
        )
        .unwrap()
    };

    // The blank code renders an empty identity and fails classification.
    let source = MemorySource::new(vec![
        product("p1", "A2"),
        product("", "ghost"),
        product("p2", "B"),
    ]);
    source.link_to(&merge).unwrap();
    source.execute();
    merge.wait().await.unwrap();
    failures.wait().await.unwrap();

    let summary: Vec<(Option<Cell>, Option<ChangeAction>)> = merge
        .delta()
        .iter()
        .map(|row| (row.get("code").cloned(), row.action()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (
                Some(Cell::String("p1".to_owned())),
                Some(ChangeAction::Update)
            ),
            (
                Some(Cell::String("p2".to_owned())),
                Some(ChangeAction::Insert)
            ),
        ]
    );

    let failed = failures.rows().await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.contains("identity"));
    assert!(failed[0].record_json.contains("ghost"));

    let rows = db.table_rows("products").await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn merge_batches_large_streams() {
    init_tracing();

    let identity = customers_table();
    let seeds: Vec<(i64, String)> = (1..=10).map(|id| (id, format!("n{id}"))).collect();
    let seed_refs: Vec<(i64, &str)> = seeds.iter().map(|(id, name)| (*id, name.as_str())).collect();
    let db = customer_db(&identity, &seed_refs).await;

    let merge = Merge::new(
        db.clone(),
        identity,
        Arc::new(customer_mapping()),
        MergeConfig {
            batch: BatchConfig::new(3).unwrap(),
            ..MergeConfig::default()
        },
    )
    .unwrap();

    // Update every even row, drop every row above 8.
    let stream: Vec<Customer> = (1..=8)
        .map(|id| {
            if id % 2 == 0 {
                customer(id, "updated")
            } else {
                customer(id, &format!("n{id}"))
            }
        })
        .collect();
    run_merge(&merge, stream).await;

    let pairs = customer_pairs(&db, "customers").await;
    assert_eq!(pairs.len(), 8);
    assert_eq!(pairs[1], (2, "updated".to_owned()));
    assert_eq!(pairs[7], (8, "updated".to_owned()));

    let delta = merge.delta();
    assert_eq!(delta.len(), 10);
    let deletes: Vec<i64> = delta
        .iter()
        .filter(|row| row.action() == Some(ChangeAction::Delete))
        .map(|row| row.id)
        .collect();
    assert_eq!(deletes, vec![9, 10]);
}
