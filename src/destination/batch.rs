use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::select;
use tracing::{debug, warn};

use crate::concurrency::completion::{
    CompletionRx, CompletionTx, create_completion, wait_all,
};
use crate::concurrency::hold;
use crate::config::BatchConfig;
use crate::destination::BatchWrite;
use crate::error::FlowResult;
use crate::pipeline::errors::{ErrorOutput, SerializerSlot, serialize_record};
use crate::pipeline::link::StageInput;
use crate::pipeline::{FailedRecord, LinkTarget, divert_or_fail};

/// Hook run on every batch before it is written.
///
/// Receives the full batch and returns the records to actually write; returning an
/// empty vector skips the write while still advancing batch progress.
pub type BeforeWrite<T> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, FlowResult<Vec<T>>> + Send + Sync>;

struct HookSlot<T> {
    inner: Mutex<Option<BeforeWrite<T>>>,
}

impl<T> HookSlot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    fn install(&self, hook: BeforeWrite<T>) {
        *hold(&self.inner) = Some(hook);
    }

    fn get(&self) -> Option<BeforeWrite<T>> {
        hold(&self.inner).clone()
    }
}

/// Batching sink over a [`BatchWrite`] implementation.
pub struct BatchDestination<T, W> {
    input: Arc<StageInput<T>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<T>>,
    hook: Arc<HookSlot<T>>,
    batches_processed: Arc<AtomicU64>,
    records_written: Arc<AtomicU64>,
    completion_rx: CompletionRx,
    _writer: std::marker::PhantomData<W>,
}

impl<T, W> BatchDestination<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: BatchWrite<T>,
{
    pub fn new(writer: W, batch: BatchConfig) -> FlowResult<Self> {
        batch.validate()?;

        let (completion_tx, completion_rx) = create_completion();
        let input = StageInput::new("batch_destination", crate::config::DEFAULT_BUFFER_CAPACITY);
        let errors = Arc::new(ErrorOutput::new("batch_destination_errors"));
        let serializer = Arc::new(SerializerSlot::new());
        let hook = Arc::new(HookSlot::new());
        let batches_processed = Arc::new(AtomicU64::new(0));
        let records_written = Arc::new(AtomicU64::new(0));

        spawn_worker(Worker {
            input: input.clone(),
            errors: errors.clone(),
            serializer: serializer.clone(),
            hook: hook.clone(),
            batches_processed: batches_processed.clone(),
            records_written: records_written.clone(),
            completion: completion_tx,
            writer,
            max_batch: batch.max_size,
        });

        Ok(Self {
            input,
            errors,
            serializer,
            hook,
            batches_processed,
            records_written,
            completion_rx,
            _writer: std::marker::PhantomData,
        })
    }

    /// Installs the pre-write hook. Install before any source executes.
    pub fn set_before_write(&self, hook: BeforeWrite<T>) {
        self.hook.install(hook);
    }

    /// Routes records failing an individual write to `target` instead of faulting.
    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        T: Serialize,
    {
        self.serializer
            .install(Arc::new(|record: &T| serialize_record(record)));
        self.errors.attach(target)
    }

    /// Completion handle resolved once all input was written.
    pub fn completion(&self) -> CompletionRx {
        self.completion_rx.clone()
    }

    /// Waits for this destination to finish.
    pub async fn wait(&self) -> FlowResult<()> {
        self.completion_rx.clone().wait().await
    }

    /// Number of batches handed to the pre-write hook, including ones it emptied.
    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    /// Number of records physically written.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }
}

struct Worker<T, W> {
    input: Arc<StageInput<T>>,
    errors: Arc<ErrorOutput>,
    serializer: Arc<SerializerSlot<T>>,
    hook: Arc<HookSlot<T>>,
    batches_processed: Arc<AtomicU64>,
    records_written: Arc<AtomicU64>,
    completion: CompletionTx,
    writer: W,
    max_batch: usize,
}

fn spawn_worker<T, W>(worker: Worker<T, W>)
where
    T: Clone + Send + Sync + 'static,
    W: BatchWrite<T>,
{
    tokio::spawn(async move {
        let Worker {
            input,
            errors,
            serializer,
            hook,
            batches_processed,
            records_written,
            completion,
            writer,
            max_batch,
        } = worker;

        let outcome = async {
            let mut rx = input.take_receiver()?;
            let mut fault = input.fault_watch();
            let mut buffer: Vec<T> = Vec::with_capacity(max_batch);

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

                        buffer.push(record);
                        if buffer.len() >= max_batch {
                            flush(
                                &mut buffer,
                                &writer,
                                &hook,
                                &errors,
                                &serializer,
                                &batches_processed,
                                &records_written,
                            )
                            .await?;
                        }
                    }
                }
            }

            flush(
                &mut buffer,
                &writer,
                &hook,
                &errors,
                &serializer,
                &batches_processed,
                &records_written,
            )
            .await?;

            wait_all(input.upstreams_snapshot()).await
        }
        .await;

        completion.resolve_with(outcome);
        errors.close();
    });
}

async fn flush<T, W>(
    buffer: &mut Vec<T>,
    writer: &W,
    hook: &HookSlot<T>,
    errors: &ErrorOutput,
    serializer: &SerializerSlot<T>,
    batches_processed: &AtomicU64,
    records_written: &AtomicU64,
) -> FlowResult<()>
where
    T: Clone + Send + Sync + 'static,
    W: BatchWrite<T>,
{
    if buffer.is_empty() {
        return Ok(());
    }

    let mut batch = std::mem::take(buffer);
    if let Some(hook) = hook.get() {
        batch = hook(batch).await?;
    }

    batches_processed.fetch_add(1, Ordering::Relaxed);

    if batch.is_empty() {
        debug!("batch emptied by pre-write hook, skipping write");
        return Ok(());
    }

    let count = batch.len() as u64;
    let retryable = errors.is_attached();
    let saved = retryable.then(|| batch.clone());

    match writer.write(batch).await {
        Ok(()) => {
            records_written.fetch_add(count, Ordering::Relaxed);
            debug!(records = count, "batch written");
            Ok(())
        }
        Err(batch_err) => match saved {
            // Retry record by record so only the offending records divert.
            Some(records) => {
                warn!(error = %batch_err, "batch write failed, retrying per record");

                for record in records {
                    let snapshot = serializer.get().map(|render| render(&record));
                    match writer.write(vec![record]).await {
                        Ok(()) => {
                            records_written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => divert_or_fail(errors, snapshot, err).await?,
                    }
                }

                Ok(())
            }
            None => Err(batch_err),
        },
    }
}

impl<T, W> LinkTarget<T> for BatchDestination<T, W>
where
    T: Clone + Send + Sync + 'static,
    W: BatchWrite<T>,
{
    fn input(&self) -> &Arc<StageInput<T>> {
        &self.input
    }
}
