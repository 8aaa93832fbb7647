use std::sync::{Arc, Mutex};

use crate::concurrency::completion::{CompletionRx, CompletionTx, create_completion};
use crate::concurrency::hold;
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::pipeline::link::StageOutput;
use crate::pipeline::LinkSource;

/// Pulls records from a caller-supplied hook until it returns `None`.
///
/// The escape hatch for producing records from arbitrary in-process state: the hook
/// is invoked repeatedly on the stage task, `Ok(Some(record))` pushes downstream,
/// `Ok(None)` completes the source, `Err` faults it.
pub struct CallbackSource<T, F> {
    read: Mutex<Option<F>>,
    output: Arc<StageOutput<T>>,
    completion_tx: CompletionTx,
    completion_rx: CompletionRx,
}

impl<T, F> CallbackSource<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> FlowResult<Option<T>> + Send + 'static,
{
    pub fn new(read: F) -> Self {
        let (completion_tx, completion_rx) = create_completion();

        Self {
            read: Mutex::new(Some(read)),
            output: Arc::new(StageOutput::new("callback_source")),
            completion_tx,
            completion_rx,
        }
    }

    /// Starts pulling from the hook. Call after wiring the graph.
    pub fn execute(&self) {
        let read = hold(&self.read).take();
        let output = self.output.clone();
        let completion = self.completion_tx.clone();

        tokio::spawn(async move {
            let Some(mut read) = read else {
                completion.fault(flow_error!(
                    ErrorKind::InvalidState,
                    "Callback source executed twice"
                ));
                output.close();
                return;
            };

            let outcome = loop {
                match read() {
                    Ok(Some(item)) => {
                        if let Err(err) = output.send(item).await {
                            break Err(err);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };

            completion.resolve_with(outcome);
            output.close();
        });
    }
}

impl<T, F> LinkSource<T> for CallbackSource<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> FlowResult<Option<T>> + Send + 'static,
{
    fn output(&self) -> &StageOutput<T> {
        &self.output
    }

    fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }
}
