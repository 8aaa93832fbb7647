use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::concurrency::completion::{
    CompletionRx, CompletionTx, create_completion,
};
use crate::concurrency::hold;
use crate::destination::{BeforeWrite, DbDestination};
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::merge::{MergeConfig, MergeMode};
use crate::mergeable::{Mergeable, RecordMapping, mapping_of};
use crate::pipeline::link::{StageInput, StageOutput};
use crate::pipeline::{FailedRecord, LinkSource, LinkTarget};
use crate::source::DbTableSource;
use crate::sql::{DbClient, TableIdentity};
use crate::transform::Lookup;
use crate::types::ChangeAction;

/// Mutable state of one merge run.
///
/// `original_rows` is the destination snapshot with per-row classification marks,
/// `index` maps record identity to its snapshot position, `delta` accumulates the
/// emitted change set in processing order.
struct Session<T> {
    original_rows: Vec<T>,
    index: HashMap<String, usize>,
    delta: Vec<T>,
    truncated: bool,
    primed: bool,
}

impl<T> Default for Session<T> {
    fn default() -> Self {
        Self {
            original_rows: Vec::new(),
            index: HashMap::new(),
            delta: Vec::new(),
            truncated: false,
            primed: false,
        }
    }
}

impl<T: Mergeable> Session<T> {
    fn prime(&mut self, rows: Vec<T>) -> FlowResult<()> {
        let mut index = HashMap::with_capacity(rows.len());

        for (position, row) in rows.iter().enumerate() {
            let id = row.id()?;
            if index.insert(id.clone(), position).is_some() {
                return Err(flow_error!(
                    ErrorKind::InvalidData,
                    "Duplicate identity in destination snapshot",
                    id
                ));
            }
        }

        self.original_rows = rows;
        self.index = index;
        self.primed = true;

        Ok(())
    }
}

/// Reconciles an incoming record stream against a database table.
///
/// In [`MergeMode::Full`] and [`MergeMode::Delta`] the engine snapshots the
/// destination up front and classifies each record against it; in
/// [`MergeMode::NoDeletions`] classification happens per batch with a targeted
/// destination query. Writes flow through an internal batching destination whose
/// pre-write hook issues the deletes and filters what gets inserted. After the
/// destination completed, finalization handles destination rows missing from the
/// stream and replays the accumulated change set downstream in order.
pub struct Merge<T: Mergeable, C: DbClient> {
    config: MergeConfig,
    table: TableIdentity,
    session: Arc<Mutex<Session<T>>>,
    head_input: Arc<StageInput<T>>,
    output: Arc<StageOutput<T>>,
    completion_rx: CompletionRx,
    lookup: Option<Lookup<T>>,
    destination: DbDestination<T, C>,
}

impl<T: Mergeable, C: DbClient> std::fmt::Debug for Merge<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merge")
            .field("config", &self.config)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<T, C> Merge<T, C>
where
    T: Mergeable,
    C: DbClient,
{
    pub fn new(
        client: C,
        table: TableIdentity,
        mapping: Arc<RecordMapping<T>>,
        config: MergeConfig,
    ) -> FlowResult<Self> {
        config.batch.validate()?;

        let truncate = config.mode == MergeMode::Full
            && (config.use_truncate || !table.has_primary_key());

        let session: Arc<Mutex<Session<T>>> = Arc::new(Mutex::new(Session::default()));
        let destination = DbDestination::new(
            client.clone(),
            table.clone(),
            mapping.clone(),
            config.batch.clone(),
        )?;

        let (lookup, head_input, store) = match config.mode {
            MergeMode::Full | MergeMode::Delta => {
                let store: Arc<Mutex<Vec<T>>> = Arc::new(Mutex::new(Vec::new()));
                let scan =
                    DbTableSource::for_table(client.clone(), table.clone(), mapping.clone());
                let lookup =
                    Lookup::with_store(scan, classifier(session.clone(), store.clone()), store.clone());
                lookup.link_to(&destination)?;

                let head_input = lookup.input().clone();
                (Some(lookup), head_input, Some(store))
            }
            MergeMode::NoDeletions => (None, destination.input().clone(), None),
        };

        destination.set_before_write(batch_hook(
            config.mode,
            truncate,
            config.batch.max_size,
            session.clone(),
            client.clone(),
            table.clone(),
            mapping.clone(),
        ));

        let (completion_tx, completion_rx) = create_completion();
        let output: Arc<StageOutput<T>> = Arc::new(StageOutput::new("merge"));

        spawn_finalizer(FinalizerArgs {
            mode: config.mode,
            truncate,
            chunk: config.batch.max_size,
            client,
            table: table.clone(),
            session: session.clone(),
            store,
            destination_completion: destination.completion(),
            output: output.clone(),
            completion: completion_tx,
        });

        Ok(Self {
            config,
            table,
            session,
            head_input,
            output,
            completion_rx,
            lookup,
            destination,
        })
    }

    /// Builds the engine using the mapping registered for `T`.
    pub fn from_registry(
        client: C,
        table: TableIdentity,
        config: MergeConfig,
    ) -> FlowResult<Self> {
        let mapping = mapping_of::<T>()?;
        Self::new(client, table, mapping, config)
    }

    pub fn mode(&self) -> MergeMode {
        self.config.mode
    }

    pub fn table(&self) -> &TableIdentity {
        &self.table
    }

    /// True when destination cleanup happens via truncation instead of targeted
    /// deletes: [`MergeMode::Full`] with truncation requested or no primary key.
    pub fn use_truncate(&self) -> bool {
        self.config.mode == MergeMode::Full
            && (self.config.use_truncate || !self.table.has_primary_key())
    }

    /// Snapshot of the accumulated change set.
    pub fn delta(&self) -> Vec<T> {
        hold(&self.session).delta.clone()
    }

    /// Waits for the full merge, including finalization and replay.
    pub async fn wait(&self) -> FlowResult<()> {
        self.completion_rx.clone().wait().await
    }

    /// Routes records failing classification or an individual write to `target`.
    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        T: Serialize,
    {
        if let Some(lookup) = &self.lookup {
            lookup.link_errors_to(target)?;
        }
        self.destination.link_errors_to(target)
    }
}

/// Builds the per-record classifier for snapshot-primed modes.
fn classifier<T: Mergeable>(
    session: Arc<Mutex<Session<T>>>,
    store: Arc<Mutex<Vec<T>>>,
) -> impl Fn(T) -> FlowResult<T> + Send + Sync + 'static {
    move |mut row: T| {
        let mut session = hold(&session);
        if !session.primed {
            let snapshot = std::mem::take(&mut *hold(&store));
            session.prime(snapshot)?;
        }

        row.set_change_action();
        let id = row.id()?;

        match row.action() {
            // Pre-flagged records (delete markers) keep their action; mirror it on
            // the snapshot so finalization does not treat the row as missing.
            Some(action) => {
                if let Some(&position) = session.index.get(&id) {
                    session.original_rows[position].set_action(Some(action));
                }
            }
            None => match session.index.get(&id).copied() {
                None => row.set_action(Some(ChangeAction::Insert)),
                Some(position) => {
                    let action = if row.equals_without_id(&session.original_rows[position]) {
                        ChangeAction::None
                    } else {
                        ChangeAction::Update
                    };
                    row.set_action(Some(action));
                    session.original_rows[position].set_action(Some(action));
                }
            },
        }

        Ok(row)
    }
}

/// Builds the destination pre-write hook applying merge semantics to each batch.
fn batch_hook<T, C>(
    mode: MergeMode,
    truncate: bool,
    chunk: usize,
    session: Arc<Mutex<Session<T>>>,
    client: C,
    table: TableIdentity,
    mapping: Arc<RecordMapping<T>>,
) -> BeforeWrite<T>
where
    T: Mergeable,
    C: DbClient,
{
    Arc::new(move |mut batch: Vec<T>| {
        let session = session.clone();
        let client = client.clone();
        let table = table.clone();
        let mapping = mapping.clone();

        async move {
            if mode == MergeMode::NoDeletions {
                classify_against_destination(&client, &table, &mapping, &mut batch).await?;
            }

            {
                let mut session = hold(&session);
                for row in &batch {
                    if mode == MergeMode::NoDeletions
                        && row.action() == Some(ChangeAction::Delete)
                    {
                        continue;
                    }
                    session.delta.push(row.clone());
                }
            }

            if truncate {
                let needs_truncate = !hold(&session).truncated;
                if needs_truncate {
                    let sql = client.dialect().truncate_sql(table.name());
                    info!(table = %table.name(), "truncating destination before rewrite");
                    client.execute(&sql).await?;
                    hold(&session).truncated = true;
                }

                // Everything but flagged deletes is rewritten.
                return Ok(batch
                    .into_iter()
                    .filter(|row| row.action() != Some(ChangeAction::Delete))
                    .collect());
            }

            let mut doomed = Vec::new();
            for row in &batch {
                // Updates clear the stale row before the rewrite; flagged deletes
                // are removed and never reinserted. This holds in every mode,
                // NoDeletions only skips the unmatched-row finalization.
                if matches!(
                    row.action(),
                    Some(ChangeAction::Update | ChangeAction::Delete)
                ) {
                    doomed.push(row.id()?);
                }
            }
            delete_by_ids(&client, &table, &doomed, chunk).await?;

            Ok(batch
                .into_iter()
                .filter(|row| {
                    matches!(
                        row.action(),
                        Some(ChangeAction::Insert | ChangeAction::Update)
                    )
                })
                .collect())
        }
        .boxed()
    })
}

/// Classifies a batch against the destination with a targeted identity query.
async fn classify_against_destination<T, C>(
    client: &C,
    table: &TableIdentity,
    mapping: &Arc<RecordMapping<T>>,
    batch: &mut Vec<T>,
) -> FlowResult<()>
where
    T: Mergeable,
    C: DbClient,
{
    for row in batch.iter_mut() {
        row.set_change_action();
    }

    let mut ids = Vec::with_capacity(batch.len());
    for row in batch.iter() {
        ids.push(row.id()?);
    }

    let dialect = client.dialect();
    let predicate = dialect.id_in_predicate(table.primary_key(), &ids)?;
    let sql = format!(
        "{} WHERE {}",
        dialect.select_sql(table.name(), mapping.columns()),
        predicate
    );

    let rows = client.execute_reader(&sql).await?;
    let mut existing = HashMap::with_capacity(rows.len());
    for row in &rows {
        let record: T = mapping.from_row(row)?;
        existing.insert(record.id()?, record);
    }

    for (row, id) in batch.iter_mut().zip(ids.iter()) {
        if row.action().is_some() {
            continue;
        }

        let action = match existing.get(id) {
            None => ChangeAction::Insert,
            Some(current) => {
                if row.equals_without_id(current) {
                    ChangeAction::None
                } else {
                    ChangeAction::Update
                }
            }
        };
        row.set_action(Some(action));
    }

    Ok(())
}

/// Deletes the rows with the given identities, chunking the `IN` lists.
async fn delete_by_ids<C: DbClient>(
    client: &C,
    table: &TableIdentity,
    ids: &[String],
    chunk: usize,
) -> FlowResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut removed = 0;
    for part in ids.chunks(chunk.max(1)) {
        let sql = client
            .dialect()
            .delete_by_ids_sql(table.name(), table.primary_key(), part)?;
        removed += client.execute(&sql).await?;
    }

    debug!(table = %table.name(), removed, "identity delete");
    Ok(removed)
}

struct FinalizerArgs<T: Mergeable, C: DbClient> {
    mode: MergeMode,
    truncate: bool,
    chunk: usize,
    client: C,
    table: TableIdentity,
    session: Arc<Mutex<Session<T>>>,
    store: Option<Arc<Mutex<Vec<T>>>>,
    destination_completion: CompletionRx,
    output: Arc<StageOutput<T>>,
    completion: CompletionTx,
}

fn spawn_finalizer<T: Mergeable, C: DbClient>(args: FinalizerArgs<T, C>) {
    tokio::spawn(async move {
        let FinalizerArgs {
            mode,
            truncate,
            chunk,
            client,
            table,
            session,
            store,
            mut destination_completion,
            output,
            completion,
        } = args;

        let outcome = match destination_completion.wait().await {
            Ok(()) => {
                finalize(
                    mode, truncate, chunk, &client, &table, &session, store.as_ref(), &output,
                )
                .await
            }
            Err(err) => Err(err),
        };

        completion.resolve_with(outcome);
        output.close();
    });
}

/// Runs after the destination completed: removes destination rows the stream did
/// not account for, then replays the change set downstream in order.
#[allow(clippy::too_many_arguments)]
async fn finalize<T, C>(
    mode: MergeMode,
    truncate: bool,
    chunk: usize,
    client: &C,
    table: &TableIdentity,
    session: &Arc<Mutex<Session<T>>>,
    store: Option<&Arc<Mutex<Vec<T>>>>,
    output: &Arc<StageOutput<T>>,
) -> FlowResult<()>
where
    T: Mergeable,
    C: DbClient,
{
    if mode != MergeMode::NoDeletions {
        let doomed_ids: Vec<String> = {
            let mut session = hold(session);

            // An empty stream never invoked the classifier; prime from the snapshot
            // the lookup materialized.
            if !session.primed && let Some(store) = store {
                let snapshot = std::mem::take(&mut *hold(store));
                session.prime(snapshot)?;
            }

            let mut ids = Vec::new();
            for row in &session.original_rows {
                if is_finalization_target(mode, row) {
                    ids.push(row.id()?);
                }
            }
            ids
        };

        if !doomed_ids.is_empty() {
            if !truncate {
                delete_by_ids(client, table, &doomed_ids, chunk).await?;
            }
            info!(removed = doomed_ids.len(), "merge finalized deletions");
        }

        {
            let mut session = hold(session);
            let targets: Vec<usize> = session
                .original_rows
                .iter()
                .enumerate()
                .filter(|(_, row)| is_finalization_target(mode, *row))
                .map(|(position, _)| position)
                .collect();

            for position in targets {
                session.original_rows[position].set_action(Some(ChangeAction::Delete));
                let row = session.original_rows[position].clone();
                session.delta.push(row);
            }
        }
    }

    let delta = hold(session).delta.clone();
    debug!(records = delta.len(), "replaying change set");
    for row in delta {
        output.send(row).await?;
    }

    Ok(())
}

/// Destination snapshot rows finalization removes: unaccounted rows in full mode,
/// explicitly flagged rows in delta mode.
fn is_finalization_target<T: Mergeable>(mode: MergeMode, row: &T) -> bool {
    match mode {
        MergeMode::Full => row.action().is_none(),
        MergeMode::Delta => row.action() == Some(ChangeAction::Delete),
        MergeMode::NoDeletions => false,
    }
}

impl<T, C> LinkTarget<T> for Merge<T, C>
where
    T: Mergeable,
    C: DbClient,
{
    fn input(&self) -> &Arc<StageInput<T>> {
        &self.head_input
    }
}

impl<T, C> LinkSource<T> for Merge<T, C>
where
    T: Mergeable,
    C: DbClient,
{
    fn output(&self) -> &StageOutput<T> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}
