//! Producing stages.

mod callback;
mod db;
mod memory;

pub use callback::CallbackSource;
pub use db::DbTableSource;
pub use memory::MemorySource;

use std::future::Future;

use crate::error::FlowResult;

/// One-shot bulk read of records, used to prime lookups.
pub trait FetchRows<T>: Send + 'static {
    /// Materializes all records. Consumes the fetcher.
    fn fetch_all(self) -> impl Future<Output = FlowResult<Vec<T>>> + Send;
}
