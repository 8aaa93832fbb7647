//! Per-record error diversion.
//!
//! A stage with an attached error channel reroutes failing records as
//! [`FailedRecord`] envelopes instead of faulting. The channel is an ordinary link,
//! so any stage accepting `FailedRecord` can collect them; it always completes
//! successfully after its owning stage finished.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::concurrency::completion::{CompletionRx, CompletionTx, create_completion};
use crate::concurrency::hold;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::link::StageOutput;
use crate::pipeline::LinkTarget;

/// A record that failed processing, with the failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Rendered error text.
    pub error: String,
    /// Time the failure was reported.
    pub report_time: DateTime<Utc>,
    /// JSON rendering of the failing record.
    pub record_json: String,
}

impl FailedRecord {
    pub fn new(error: &FlowError, record_json: String) -> Self {
        Self {
            error: error.to_string(),
            report_time: Utc::now(),
            record_json,
        }
    }
}

/// The error-diversion side channel of a stage.
///
/// Materialized lazily: until [`ErrorOutput::attach`] is called the channel carries
/// no edges and the owning stage treats record failures as fatal.
pub struct ErrorOutput {
    output: StageOutput<FailedRecord>,
    completion_tx: CompletionTx,
    completion_rx: CompletionRx,
    attached: AtomicBool,
}

impl ErrorOutput {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        let (completion_tx, completion_rx) = create_completion();

        Self {
            output: StageOutput::new(label),
            completion_tx,
            completion_rx,
            attached: AtomicBool::new(false),
        }
    }

    /// True once at least one collector is linked.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Links a collector stage to this channel.
    pub(crate) fn attach<G: LinkTarget<FailedRecord>>(&self, target: &G) -> FlowResult<()> {
        let sender = target.input().sender()?;
        self.output.add_edge(sender, None, None);
        target.input().register_upstream(self.completion_rx.clone());
        self.attached.store(true, Ordering::Release);

        Ok(())
    }

    /// Emits one failed record.
    pub(crate) async fn send(&self, error: &FlowError, record_json: String) -> FlowResult<()> {
        self.output
            .send(FailedRecord::new(error, record_json))
            .await
    }

    /// Completes the channel. Called after the owning stage resolved its own
    /// completion, and always resolves successfully.
    pub(crate) fn close(&self) {
        self.completion_tx.resolve();
        self.output.close();
    }
}

/// Shared serializer used to render records for diversion.
pub(crate) type RecordSerializer<T> =
    std::sync::Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Slot for a serializer installed when an error channel is attached.
pub(crate) struct SerializerSlot<T> {
    inner: Mutex<Option<RecordSerializer<T>>>,
}

impl<T> SerializerSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn install(&self, serializer: RecordSerializer<T>) {
        *hold(&self.inner) = Some(serializer);
    }

    pub(crate) fn get(&self) -> Option<RecordSerializer<T>> {
        hold(&self.inner).clone()
    }
}

/// Renders a record as JSON, falling back to the serializer error text.
pub(crate) fn serialize_record<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).unwrap_or_else(|err| err.to_string())
}
