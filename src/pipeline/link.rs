//! Channel plumbing between stages.
//!
//! A producing stage owns a [`StageOutput`] holding one edge per downstream link; a
//! consuming stage owns a [`StageInput`] wrapping a bounded mpsc channel. Linking
//! adds an edge to the producer and registers the producer's completion handle with
//! the consumer, which closes its channel once every registered upstream completed
//! and propagates the first upstream fault through a watch channel.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::concurrency::completion::{CompletionRx, wait_all};
use crate::concurrency::hold;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;

/// Predicate deciding whether a record takes a given link.
pub type RecordPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct LinkEdge<T> {
    tx: mpsc::Sender<T>,
    keep: Option<RecordPredicate<T>>,
    divert: Option<RecordPredicate<T>>,
}

/// The sending side of a stage.
///
/// Records are offered to every edge; an edge accepts when it carries no predicate
/// or its keep predicate matches. Records accepted by no edge are dropped, counted
/// as diverted when the edge's divert predicate matches.
pub struct StageOutput<T> {
    label: String,
    edges: Mutex<Vec<LinkEdge<T>>>,
    diverted: AtomicU64,
}

impl<T: Send + 'static> StageOutput<T> {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            edges: Mutex::new(Vec::new()),
            diverted: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_edge(
        &self,
        tx: mpsc::Sender<T>,
        keep: Option<RecordPredicate<T>>,
        divert: Option<RecordPredicate<T>>,
    ) {
        hold(&self.edges).push(LinkEdge { tx, keep, divert });
    }

    /// Number of records dropped at this output with a matching divert predicate.
    pub fn diverted(&self) -> u64 {
        self.diverted.load(Ordering::Relaxed)
    }

    /// Routes one record to all matching edges.
    pub(crate) async fn send(&self, item: T) -> FlowResult<()>
    where
        T: Clone,
    {
        let targets: Vec<mpsc::Sender<T>> = {
            let edges = hold(&self.edges);
            let mut matching = Vec::new();

            for edge in edges.iter() {
                let kept = edge.keep.as_ref().is_none_or(|keep| keep(&item));
                if kept {
                    matching.push(edge.tx.clone());
                } else if edge.divert.as_ref().is_some_and(|divert| divert(&item)) {
                    self.diverted.fetch_add(1, Ordering::Relaxed);
                    trace!(stage = %self.label, "record diverted to void sink");
                }
            }

            matching
        };

        let count = targets.len();
        if count == 0 {
            return Ok(());
        }

        for tx in targets.iter().take(count - 1) {
            tx.send(item.clone()).await.map_err(|_| closed_link_error())?;
        }
        targets[count - 1]
            .send(item)
            .await
            .map_err(|_| closed_link_error())?;

        Ok(())
    }

    /// Drops all edges, closing downstream channels once their other senders are gone.
    pub(crate) fn close(&self) {
        hold(&self.edges).clear();
    }
}

fn closed_link_error() -> FlowError {
    flow_error!(
        ErrorKind::InvalidState,
        "Linked stage stopped accepting records"
    )
}

/// The receiving side of a stage.
///
/// Holds the base sender of its bounded channel open until every registered upstream
/// completed, so fan-in consumers see end-of-input only after all producers finished.
/// The first upstream fault is published on a watch channel for fail-fast shutdown.
pub struct StageInput<T> {
    label: String,
    base_tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    upstreams: Mutex<Vec<CompletionRx>>,
    closer_started: AtomicBool,
    fault_tx: watch::Sender<Option<FlowError>>,
}

impl<T: Send + 'static> StageInput<T> {
    pub(crate) fn new(label: impl Into<String>, capacity: usize) -> Arc<Self> {
        let (base_tx, rx) = mpsc::channel(capacity);
        let (fault_tx, _) = watch::channel(None);

        Arc::new(Self {
            label: label.into(),
            base_tx: Mutex::new(Some(base_tx)),
            rx: Mutex::new(Some(rx)),
            upstreams: Mutex::new(Vec::new()),
            closer_started: AtomicBool::new(false),
            fault_tx,
        })
    }

    /// Returns a new sender into this input's channel.
    pub(crate) fn sender(&self) -> FlowResult<mpsc::Sender<T>> {
        hold(&self.base_tx).clone().ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidState,
                "Stage input already closed",
                self.label.clone()
            )
        })
    }

    /// Takes the single receiver backing this input. Called once by the stage worker.
    pub(crate) fn take_receiver(&self) -> FlowResult<mpsc::Receiver<T>> {
        hold(&self.rx).take().ok_or_else(|| {
            flow_error!(
                ErrorKind::InvalidState,
                "Stage input receiver already taken",
                self.label.clone()
            )
        })
    }

    /// Returns a watch handle observing the first upstream fault.
    pub(crate) fn fault_watch(&self) -> watch::Receiver<Option<FlowError>> {
        self.fault_tx.subscribe()
    }

    /// Snapshot of the registered upstream completions.
    pub(crate) fn upstreams_snapshot(&self) -> Vec<CompletionRx> {
        hold(&self.upstreams).clone()
    }

    /// Registers an upstream producer, starting the closer task on first use.
    pub(crate) fn register_upstream(self: &Arc<Self>, completion: CompletionRx) {
        hold(&self.upstreams).push(completion);

        if !self.closer_started.swap(true, Ordering::SeqCst) {
            self.spawn_closer();
        }
    }

    fn spawn_closer(self: &Arc<Self>) {
        let input = self.clone();

        tokio::spawn(async move {
            let mut awaited = 0;

            loop {
                let snapshot = input.upstreams_snapshot();
                if snapshot.len() == awaited {
                    // All registered upstreams completed successfully.
                    hold(&input.base_tx).take();
                    debug!(stage = %input.label, upstreams = awaited, "input closed");
                    return;
                }

                let pending: Vec<CompletionRx> = snapshot[awaited..].to_vec();
                awaited = snapshot.len();

                if let Err(err) = wait_all(pending).await {
                    debug!(stage = %input.label, error = %err, "upstream fault observed");
                    let _ = input.fault_tx.send(Some(err));
                    hold(&input.base_tx).take();
                    return;
                }
            }
        });
    }
}
