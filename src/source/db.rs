use std::sync::Arc;

use tracing::info;

use crate::concurrency::completion::{CompletionRx, CompletionTx, create_completion};
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::mergeable::RecordMapping;
use crate::pipeline::LinkSource;
use crate::pipeline::errors::{ErrorOutput, serialize_record};
use crate::pipeline::link::StageOutput;
use crate::source::FetchRows;
use crate::sql::{DbClient, TableIdentity};

#[derive(Debug)]
enum QuerySpec {
    Table(TableIdentity),
    Sql(String),
}

/// Reads records from a database table or query.
///
/// Can be executed as a pipeline source, pushing materialized records downstream,
/// or drained in one shot through [`FetchRows`] to prime a lookup. Rows that fail
/// to materialize divert to the error channel when one is attached.
pub struct DbTableSource<T, C: DbClient> {
    client: C,
    mapping: Arc<RecordMapping<T>>,
    query: QuerySpec,
    output: Arc<StageOutput<T>>,
    errors: Arc<ErrorOutput>,
    completion_tx: CompletionTx,
    completion_rx: CompletionRx,
}

impl<T, C: DbClient> std::fmt::Debug for DbTableSource<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTableSource")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl<T, C> DbTableSource<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: DbClient,
{
    /// Builds a source scanning an entire table.
    pub fn for_table(client: C, table: TableIdentity, mapping: Arc<RecordMapping<T>>) -> Self {
        Self::build(client, mapping, QuerySpec::Table(table))
    }

    /// Builds a source running a caller-supplied query.
    ///
    /// The query's result columns must match the mapping's column order.
    pub fn for_query(
        client: C,
        sql: impl Into<String>,
        mapping: Arc<RecordMapping<T>>,
    ) -> FlowResult<Self> {
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(flow_error!(
                ErrorKind::ConfigError,
                "Source query must not be empty"
            ));
        }

        Ok(Self::build(client, mapping, QuerySpec::Sql(sql)))
    }

    fn build(client: C, mapping: Arc<RecordMapping<T>>, query: QuerySpec) -> Self {
        let (completion_tx, completion_rx) = create_completion();

        Self {
            client,
            mapping,
            query,
            output: Arc::new(StageOutput::new("db_source")),
            errors: Arc::new(ErrorOutput::new("db_source_errors")),
            completion_tx,
            completion_rx,
        }
    }

    fn select_sql(&self) -> String {
        match &self.query {
            QuerySpec::Table(table) => self
                .client
                .dialect()
                .select_sql(table.name(), self.mapping.columns()),
            QuerySpec::Sql(sql) => sql.clone(),
        }
    }

    /// Routes rows failing materialization to `target` instead of faulting.
    pub fn link_errors_to<G: crate::pipeline::LinkTarget<crate::pipeline::FailedRecord>>(
        &self,
        target: &G,
    ) -> FlowResult<()> {
        self.errors.attach(target)
    }

    /// Starts reading and pushing records. Call after wiring the graph.
    pub fn execute(&self) {
        let sql = self.select_sql();
        let client = self.client.clone();
        let mapping = self.mapping.clone();
        let output = self.output.clone();
        let errors = self.errors.clone();
        let completion = self.completion_tx.clone();

        tokio::spawn(async move {
            let outcome = async {
                let rows = client.execute_reader(&sql).await?;
                info!(rows = rows.len(), "database source read");

                for row in rows {
                    match mapping.from_row(&row) {
                        Ok(record) => output.send(record).await?,
                        Err(err) => {
                            if errors.is_attached() {
                                errors.send(&err, serialize_record(&row)).await?;
                            } else {
                                return Err(err);
                            }
                        }
                    }
                }

                Ok(())
            }
            .await;

            completion.resolve_with(outcome);
            errors.close();
            output.close();
        });
    }
}

impl<T, C> LinkSource<T> for DbTableSource<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: DbClient,
{
    fn output(&self) -> &StageOutput<T> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}

impl<T, C> FetchRows<T> for DbTableSource<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: DbClient,
{
    async fn fetch_all(self) -> FlowResult<Vec<T>> {
        let sql = self.select_sql();
        let rows = self.client.execute_reader(&sql).await?;

        rows.iter().map(|row| self.mapping.from_row(row)).collect()
    }
}
