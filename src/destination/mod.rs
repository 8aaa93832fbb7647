//! Consuming stages.
//!
//! All destinations are built on [`BatchDestination`], which accumulates records
//! into fixed-size batches, runs an optional pre-write hook, and hands batches to a
//! [`BatchWrite`] implementation. When a whole-batch write fails and an error
//! channel is attached, the batch is retried record by record so only the offending
//! records divert.

mod batch;
mod db;
mod memory;

pub use batch::{BatchDestination, BeforeWrite};
pub use db::{DbDestination, DbWriter};
pub use memory::{MemoryDestination, MemoryWriter, VoidDestination, VoidWriter};

use std::future::Future;

use crate::error::FlowResult;

/// Writes batches of records to a backing store.
pub trait BatchWrite<T>: Send + Sync + 'static {
    fn write(&self, batch: Vec<T>) -> impl Future<Output = FlowResult<()>> + Send;
}
