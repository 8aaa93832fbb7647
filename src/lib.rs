//! Programmable data-movement pipelines for typed records.
//!
//! Stages (sources, transforms, destinations) are linked into a directed graph and
//! exchange records over bounded channels. On top of the pipeline runtime sits
//! [`merge::Merge`], a diff-and-sync engine that reconciles an incoming record
//! stream against a database table and emits the resulting change set downstream.

pub mod concurrency;
pub mod config;
pub mod destination;
pub mod error;
mod macros;
pub mod merge;
pub mod mergeable;
pub mod pipeline;
pub mod source;
pub mod sql;
pub mod transform;
pub mod types;
