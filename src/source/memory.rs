use std::sync::{Arc, Mutex};

use tracing::info;

use crate::concurrency::completion::{CompletionRx, CompletionTx, create_completion};
use crate::concurrency::hold;
use crate::error::FlowResult;
use crate::pipeline::link::StageOutput;
use crate::pipeline::LinkSource;
use crate::source::FetchRows;

/// Pushes a pre-built vector of records into the pipeline.
pub struct MemorySource<T> {
    items: Mutex<Option<Vec<T>>>,
    output: Arc<StageOutput<T>>,
    completion_tx: CompletionTx,
    completion_rx: CompletionRx,
}

impl<T: Clone + Send + Sync + 'static> MemorySource<T> {
    pub fn new(items: Vec<T>) -> Self {
        let (completion_tx, completion_rx) = create_completion();

        Self {
            items: Mutex::new(Some(items)),
            output: Arc::new(StageOutput::new("memory_source")),
            completion_tx,
            completion_rx,
        }
    }

    /// Starts pushing records to linked stages. Call after wiring the graph.
    pub fn execute(&self) {
        let items = hold(&self.items).take().unwrap_or_default();
        let output = self.output.clone();
        let completion = self.completion_tx.clone();

        tokio::spawn(async move {
            info!(records = items.len(), "memory source started");

            let mut outcome = Ok(());
            for item in items {
                if let Err(err) = output.send(item).await {
                    outcome = Err(err);
                    break;
                }
            }

            completion.resolve_with(outcome);
            output.close();
        });
    }
}

impl<T: Clone + Send + Sync + 'static> LinkSource<T> for MemorySource<T> {
    fn output(&self) -> &StageOutput<T> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}

impl<T: Clone + Send + Sync + 'static> FetchRows<T> for MemorySource<T> {
    async fn fetch_all(self) -> FlowResult<Vec<T>> {
        Ok(hold(&self.items).take().unwrap_or_default())
    }
}
