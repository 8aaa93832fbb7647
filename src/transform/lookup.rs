use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::select;
use tracing::info;

use crate::concurrency::completion::{
    CompletionRx, CompletionTx, create_completion, wait_all,
};
use crate::concurrency::hold;
use crate::error::FlowResult;
use crate::pipeline::errors::{ErrorOutput, SerializerSlot, serialize_record};
use crate::pipeline::link::{StageInput, StageOutput};
use crate::pipeline::{FailedRecord, LinkSource, LinkTarget, divert_or_fail};
use crate::source::FetchRows;

/// Enriches or classifies flowing records against a side collection.
///
/// Before processing its first record the stage drains a one-shot side source and
/// materializes the result. Every flowing record then passes through the classify
/// hook, which may consult the materialized rows. Hook failures divert to the error
/// channel when one is attached.
pub struct Lookup<T> {
    input: Arc<StageInput<T>>,
    output: Arc<StageOutput<T>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<T>>,
    rows: Arc<Mutex<Vec<T>>>,
    completion_rx: CompletionRx,
}

impl<T: Clone + Send + Sync + 'static> Lookup<T> {
    pub fn new<S: FetchRows<T>>(
        source: S,
        classify: impl Fn(T) -> FlowResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self::with_store(source, classify, Arc::new(Mutex::new(Vec::new())))
    }

    /// Builds the stage with an externally shared row store.
    pub(crate) fn with_store<S: FetchRows<T>>(
        source: S,
        classify: impl Fn(T) -> FlowResult<T> + Send + Sync + 'static,
        rows: Arc<Mutex<Vec<T>>>,
    ) -> Self {
        let (completion_tx, completion_rx) = create_completion();
        let input = StageInput::new("lookup", crate::config::DEFAULT_BUFFER_CAPACITY);
        let output = Arc::new(StageOutput::new("lookup"));
        let errors = Arc::new(ErrorOutput::new("lookup_errors"));
        let serializer = Arc::new(SerializerSlot::new());

        spawn_worker(
            input.clone(),
            output.clone(),
            errors.clone(),
            serializer.clone(),
            rows.clone(),
            completion_tx,
            source,
            Arc::new(classify),
        );

        Self {
            input,
            output,
            errors,
            serializer,
            rows,
            completion_rx,
        }
    }

    /// Snapshot of the materialized side rows.
    pub fn rows(&self) -> Vec<T> {
        hold(&self.rows).clone()
    }

    /// Routes records failing classification to `target` instead of faulting.
    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        T: Serialize,
    {
        self.serializer
            .install(Arc::new(|record: &T| serialize_record(record)));
        self.errors.attach(target)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker<T, S>(
    input: Arc<StageInput<T>>,
    output: Arc<StageOutput<T>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<T>>,
    rows: Arc<Mutex<Vec<T>>>,
    completion: CompletionTx,
    source: S,
    classify: Arc<dyn Fn(T) -> FlowResult<T> + Send + Sync>,
) where
    T: Clone + Send + Sync + 'static,
    S: FetchRows<T>,
{
    tokio::spawn(async move {
        let outcome = async {
            let fetched = source.fetch_all().await?;
            info!(rows = fetched.len(), "lookup side source materialized");
            *hold(&rows) = fetched;

            let mut rx = input.take_receiver()?;
            let mut fault = input.fault_watch();

            loop {
                select! {
                    biased;
                    _ = fault.changed() => {
                        let observed = fault.borrow_and_update().clone();
                        if let Some(err) = observed {
                            return Err(err);
                        }
                    }
                    item = rx.recv() => {
                        let Some(record) = item else { break };

                        let snapshot = serializer.get().map(|render| render(&record));
                        match classify(record) {
                            Ok(classified) => output.send(classified).await?,
                            Err(err) => divert_or_fail(&errors, snapshot, err).await?,
                        }
                    }
                }
            }

            wait_all(input.upstreams_snapshot()).await
        }
        .await;

        completion.resolve_with(outcome);
        errors.close();
        output.close();
    });
}

impl<T: Clone + Send + Sync + 'static> LinkTarget<T> for Lookup<T> {
    fn input(&self) -> &Arc<StageInput<T>> {
        &self.input
    }
}

impl<T: Clone + Send + Sync + 'static> LinkSource<T> for Lookup<T> {
    fn output(&self) -> &StageOutput<T> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}
