//! Watch-channel based completion handles.
//!
//! Every stage owns a [`CompletionTx`] that it resolves exactly once when its work
//! finishes, either successfully or with a fault. Consumers hold [`CompletionRx`]
//! clones and await the outcome. Fan-in stages wait on all of their upstream handles
//! through [`wait_all`], which fails fast on the first fault.

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;

use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;

/// Terminal state of a stage.
#[derive(Debug, Clone, Default)]
pub enum CompletionState {
    /// The stage is still running.
    #[default]
    Pending,
    /// The stage finished all of its work.
    Done,
    /// The stage stopped with an error.
    Faulted(FlowError),
}

/// Sending half of a completion handle.
///
/// Resolving is idempotent: the first terminal state wins and later calls are ignored.
#[derive(Debug, Clone)]
pub struct CompletionTx {
    tx: watch::Sender<CompletionState>,
}

/// Receiving half of a completion handle.
#[derive(Debug, Clone)]
pub struct CompletionRx {
    rx: watch::Receiver<CompletionState>,
}

/// Creates a linked completion handle pair in the [`CompletionState::Pending`] state.
pub fn create_completion() -> (CompletionTx, CompletionRx) {
    let (tx, rx) = watch::channel(CompletionState::Pending);

    (CompletionTx { tx }, CompletionRx { rx })
}

impl CompletionTx {
    /// Marks the stage as successfully completed.
    pub fn resolve(&self) {
        self.tx.send_modify(|state| {
            if matches!(state, CompletionState::Pending) {
                *state = CompletionState::Done;
            }
        });
    }

    /// Marks the stage as faulted with the supplied error.
    pub fn fault(&self, error: FlowError) {
        self.tx.send_modify(|state| {
            if matches!(state, CompletionState::Pending) {
                *state = CompletionState::Faulted(error);
            }
        });
    }

    /// Resolves the stage from a result, faulting on `Err`.
    pub fn resolve_with(&self, result: FlowResult<()>) {
        match result {
            Ok(()) => self.resolve(),
            Err(err) => self.fault(err),
        }
    }

    /// Returns a new receiving handle observing this stage.
    pub fn subscribe(&self) -> CompletionRx {
        CompletionRx {
            rx: self.tx.subscribe(),
        }
    }
}

impl CompletionRx {
    /// Returns the outcome if the stage has already reached a terminal state.
    pub fn try_result(&self) -> Option<FlowResult<()>> {
        match &*self.rx.borrow() {
            CompletionState::Pending => None,
            CompletionState::Done => Some(Ok(())),
            CompletionState::Faulted(err) => Some(Err(err.clone())),
        }
    }

    /// Waits until the stage reaches a terminal state and returns its outcome.
    ///
    /// A dropped [`CompletionTx`] that never resolved counts as a fault.
    pub async fn wait(&mut self) -> FlowResult<()> {
        loop {
            if let Some(result) = self.try_result() {
                return result;
            }

            if self.rx.changed().await.is_err() {
                // The sender is gone; a final state may still have been published.
                return self.try_result().unwrap_or_else(|| {
                    Err(flow_error!(
                        ErrorKind::StageFaulted,
                        "Stage dropped before completing"
                    ))
                });
            }
        }
    }
}

/// Waits for all supplied completion handles, failing fast on the first fault.
///
/// Returns `Ok(())` once every handle resolved successfully. If any handle faults,
/// the fault is returned immediately without waiting for the remaining handles.
pub async fn wait_all(handles: impl IntoIterator<Item = CompletionRx>) -> FlowResult<()> {
    let mut pending = handles
        .into_iter()
        .map(|mut handle| async move { handle.wait().await })
        .collect::<FuturesUnordered<_>>();

    while let Some(result) = pending.next().await {
        result?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_returns_after_resolution() {
        let (tx, mut rx) = create_completion();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.resolve();
        });

        assert!(rx.wait().await.is_ok());
    }

    #[tokio::test]
    async fn first_terminal_state_wins() {
        let (tx, mut rx) = create_completion();

        tx.resolve();
        tx.fault(flow_error!(ErrorKind::Unknown, "Too late"));

        assert!(rx.wait().await.is_ok());
    }

    #[tokio::test]
    async fn wait_all_fails_fast_on_fault() {
        let (tx_ok, rx_ok) = create_completion();
        let (tx_err, rx_err) = create_completion();

        // The successful handle never resolves; the fault must still surface.
        tx_err.fault(flow_error!(ErrorKind::QueryFailed, "Boom"));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            wait_all([rx_ok, rx_err]),
        )
        .await
        .expect("wait_all must not block on the pending handle");

        assert_eq!(result.unwrap_err().kind(), ErrorKind::QueryFailed);

        tx_ok.resolve();
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_fault() {
        let (tx, mut rx) = create_completion();
        drop(tx);

        let err = rx.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageFaulted);
    }
}
