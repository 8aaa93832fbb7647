//! Stage graph wiring.
//!
//! Stages implement [`LinkSource`] on their producing side and [`LinkTarget`] on
//! their consuming side. Wiring is push-based: linking installs a bounded channel
//! edge on the producer and registers the producer's completion with the consumer.
//! Wire the full graph before executing sources.

pub mod errors;
pub mod link;

use std::sync::Arc;

use tracing::debug;

pub use errors::FailedRecord;
pub use link::{RecordPredicate, StageInput, StageOutput};

use crate::concurrency::completion::CompletionRx;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::errors::ErrorOutput;

/// The consuming side of a stage.
pub trait LinkTarget<T: Send + 'static> {
    /// The bounded input feeding this stage.
    fn input(&self) -> &Arc<StageInput<T>>;
}

/// The producing side of a stage.
pub trait LinkSource<T: Clone + Send + 'static> {
    /// The output records leave through.
    fn output(&self) -> &StageOutput<T>;

    /// Completion handle resolved when this stage finishes producing.
    fn completion(&self) -> CompletionRx;

    /// Links every record to `target`.
    fn link_to<G: LinkTarget<T>>(&self, target: &G) -> FlowResult<()> {
        self.link_with(target, None, None)
    }

    /// Links records matching `keep` to `target`; non-matching records are dropped.
    fn link_filtered<G: LinkTarget<T>>(
        &self,
        target: &G,
        keep: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> FlowResult<()> {
        self.link_with(target, Some(Arc::new(keep)), None)
    }

    /// Links records matching `keep` to `target` and counts records matching
    /// `divert` as explicitly voided.
    fn link_routed<G: LinkTarget<T>>(
        &self,
        target: &G,
        keep: impl Fn(&T) -> bool + Send + Sync + 'static,
        divert: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> FlowResult<()> {
        self.link_with(target, Some(Arc::new(keep)), Some(Arc::new(divert)))
    }

    /// General form of linking with optional predicates.
    fn link_with<G: LinkTarget<T>>(
        &self,
        target: &G,
        keep: Option<RecordPredicate<T>>,
        divert: Option<RecordPredicate<T>>,
    ) -> FlowResult<()> {
        let sender = target.input().sender()?;
        self.output().add_edge(sender, keep, divert);
        target.input().register_upstream(self.completion());
        debug!("stage linked");

        Ok(())
    }
}

/// Reroutes a failing record to the stage's error channel, or surfaces the error as
/// fatal when no channel is attached.
///
/// `record_json` is the record rendered before the fallible hook consumed it; it is
/// `Some` exactly when a serializer was installed by `link_errors_to`.
pub(crate) async fn divert_or_fail(
    errors: &ErrorOutput,
    record_json: Option<String>,
    error: FlowError,
) -> FlowResult<()> {
    match record_json {
        Some(json) if errors.is_attached() => errors.send(&error, json).await,
        _ => Err(error),
    }
}
