use std::sync::Arc;

use serde::Serialize;
use tokio::select;

use crate::concurrency::completion::{
    CompletionRx, CompletionTx, create_completion, wait_all,
};
use crate::error::FlowResult;
use crate::pipeline::errors::{ErrorOutput, SerializerSlot, serialize_record};
use crate::pipeline::link::{StageInput, StageOutput};
use crate::pipeline::{FailedRecord, LinkSource, LinkTarget, divert_or_fail};

/// Applies a fallible mapping to every record.
///
/// A mapping failure faults the stage unless an error channel is attached, in which
/// case the failing record diverts as a [`FailedRecord`] and processing continues.
pub struct RowTransform<I, O> {
    input: Arc<StageInput<I>>,
    output: Arc<StageOutput<O>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<I>>,
    completion_rx: CompletionRx,
}

impl<I, O> RowTransform<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new(map: impl Fn(I) -> FlowResult<O> + Send + Sync + 'static) -> Self {
        Self::with_capacity(map, crate::config::DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(
        map: impl Fn(I) -> FlowResult<O> + Send + Sync + 'static,
        capacity: usize,
    ) -> Self {
        let (completion_tx, completion_rx) = create_completion();
        let input = StageInput::new("row_transform", capacity);
        let output = Arc::new(StageOutput::new("row_transform"));
        let errors = Arc::new(ErrorOutput::new("row_transform_errors"));
        let serializer = Arc::new(SerializerSlot::new());

        spawn_worker(
            input.clone(),
            output.clone(),
            errors.clone(),
            serializer.clone(),
            completion_tx,
            Arc::new(map),
        );

        Self {
            input,
            output,
            errors,
            serializer,
            completion_rx,
        }
    }

    /// Routes records failing the mapping to `target` instead of faulting.
    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        I: Serialize,
    {
        self.serializer
            .install(Arc::new(|record: &I| serialize_record(record)));
        self.errors.attach(target)
    }
}

fn spawn_worker<I, O>(
    input: Arc<StageInput<I>>,
    output: Arc<StageOutput<O>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<I>>,
    completion: CompletionTx,
    map: Arc<dyn Fn(I) -> FlowResult<O> + Send + Sync>,
) where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let outcome = async {
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
                        match map(record) {
                            Ok(mapped) => output.send(mapped).await?,
                            Err(err) => divert_or_fail(&errors, snapshot, err).await?,
                        }
                    }
                }
            }

            // Input drained; surface any upstream fault that raced the close.
            wait_all(input.upstreams_snapshot()).await
        }
        .await;

        completion.resolve_with(outcome);
        errors.close();
        output.close();
    });
}

impl<I, O> LinkTarget<I> for RowTransform<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn input(&self) -> &Arc<StageInput<I>> {
        &self.input
    }
}

impl<I, O> LinkSource<O> for RowTransform<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    fn output(&self) -> &StageOutput<O> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}
