use std::sync::Arc;

use serde::Serialize;

use crate::concurrency::completion::CompletionRx;
use crate::config::BatchConfig;
use crate::destination::batch::{BatchDestination, BeforeWrite};
use crate::destination::BatchWrite;
use crate::error::FlowResult;
use crate::mergeable::RecordMapping;
use crate::pipeline::link::StageInput;
use crate::pipeline::{FailedRecord, LinkTarget};
use crate::sql::{DbClient, TableIdentity};
use crate::types::TableRow;

/// Writer inserting record batches into a database table.
pub struct DbWriter<T, C> {
    client: C,
    table: TableIdentity,
    mapping: Arc<RecordMapping<T>>,
}

impl<T, C> BatchWrite<T> for DbWriter<T, C>
where
    T: Send + Sync + 'static,
    C: DbClient,
{
    async fn write(&self, batch: Vec<T>) -> FlowResult<()> {
        let rows: Vec<TableRow> = batch
            .iter()
            .map(|record| self.mapping.to_row(record))
            .collect();

        self.client
            .bulk_insert(&self.table, self.mapping.columns(), rows)
            .await
    }
}

/// Writes records to a database table in batches.
pub struct DbDestination<T, C: DbClient> {
    stage: BatchDestination<T, DbWriter<T, C>>,
}

impl<T, C> DbDestination<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: DbClient,
{
    pub fn new(
        client: C,
        table: TableIdentity,
        mapping: Arc<RecordMapping<T>>,
        batch: BatchConfig,
    ) -> FlowResult<Self> {
        let writer = DbWriter {
            client,
            table,
            mapping,
        };

        Ok(Self {
            stage: BatchDestination::new(writer, batch)?,
        })
    }

    /// Installs the pre-write hook. Install before any source executes.
    pub fn set_before_write(&self, hook: BeforeWrite<T>) {
        self.stage.set_before_write(hook);
    }

    /// Routes records failing an individual insert to `target` instead of faulting.
    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        T: Serialize,
    {
        self.stage.link_errors_to(target)
    }

    pub fn completion(&self) -> CompletionRx {
        self.stage.completion()
    }

    pub async fn wait(&self) -> FlowResult<()> {
        self.stage.wait().await
    }

    pub fn batches_processed(&self) -> u64 {
        self.stage.batches_processed()
    }

    pub fn records_written(&self) -> u64 {
        self.stage.records_written()
    }
}

impl<T, C> LinkTarget<T> for DbDestination<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: DbClient,
{
    fn input(&self) -> &Arc<StageInput<T>> {
        self.stage.input()
    }
}
