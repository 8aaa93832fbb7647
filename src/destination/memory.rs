use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::concurrency::completion::CompletionRx;
use crate::config::BatchConfig;
use crate::destination::batch::BatchDestination;
use crate::destination::BatchWrite;
use crate::error::FlowResult;
use crate::pipeline::link::StageInput;
use crate::pipeline::{FailedRecord, LinkTarget};

/// Writer appending batches to a shared vector.
#[derive(Clone)]
pub struct MemoryWriter<T> {
    rows: Arc<Mutex<Vec<T>>>,
}

impl<T: Send + Sync + 'static> BatchWrite<T> for MemoryWriter<T> {
    async fn write(&self, batch: Vec<T>) -> FlowResult<()> {
        self.rows.lock().await.extend(batch);
        Ok(())
    }
}

/// Collects all received records in memory, mainly for tests and inspection.
pub struct MemoryDestination<T> {
    rows: Arc<Mutex<Vec<T>>>,
    stage: BatchDestination<T, MemoryWriter<T>>,
}

impl<T: Clone + Send + Sync + 'static> MemoryDestination<T> {
    pub fn new() -> Self {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let writer = MemoryWriter { rows: rows.clone() };
        let stage = match BatchDestination::new(writer, BatchConfig::default()) {
            Ok(stage) => stage,
            Err(_) => unreachable!("default batch config is valid"),
        };

        Self { rows, stage }
    }

    pub fn with_batch(batch: BatchConfig) -> FlowResult<Self> {
        let rows = Arc::new(Mutex::new(Vec::new()));
        let writer = MemoryWriter { rows: rows.clone() };
        let stage = BatchDestination::new(writer, batch)?;

        Ok(Self { rows, stage })
    }

    /// Snapshot of everything received so far.
    pub async fn rows(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.rows.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.rows.lock().await.clear();
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

    pub fn link_errors_to<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()>
    where
        T: Serialize,
    {
        self.stage.link_errors_to(target)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MemoryDestination<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> LinkTarget<T> for MemoryDestination<T> {
    fn input(&self) -> &Arc<StageInput<T>> {
        self.stage.input()
    }
}

/// Writer that discards every batch.
#[derive(Clone, Default)]
pub struct VoidWriter;

impl<T: Send + Sync + 'static> BatchWrite<T> for VoidWriter {
    async fn write(&self, _batch: Vec<T>) -> FlowResult<()> {
        Ok(())
    }
}

/// Swallows all received records.
pub struct VoidDestination<T> {
    stage: BatchDestination<T, VoidWriter>,
}

impl<T: Clone + Send + Sync + 'static> VoidDestination<T> {
    pub fn new() -> Self {
        let stage = match BatchDestination::new(VoidWriter, BatchConfig::default()) {
            Ok(stage) => stage,
            Err(_) => unreachable!("default batch config is valid"),
        };

        Self { stage }
    }

    pub fn completion(&self) -> CompletionRx {
        self.stage.completion()
    }

    pub async fn wait(&self) -> FlowResult<()> {
        self.stage.wait().await
    }

    /// Number of records swallowed.
    pub fn records_received(&self) -> u64 {
        self.stage.records_written()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for VoidDestination<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> LinkTarget<T> for VoidDestination<T> {
    fn input(&self) -> &Arc<StageInput<T>> {
        self.stage.input()
    }
}
