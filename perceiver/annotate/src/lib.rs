#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The generic reconciliation engine shared by every perceiver variant:
//! the annotator loop (pull scan results, write labels/annotations back
//! onto source objects) and the dumper loop (push the full inventory to
//! the coordinator), both parameterized over a source adapter.

mod adapter;
mod annotator;
mod dumper;
pub mod metrics;

pub use self::{
    adapter::{AdapterError, TargetAdapter},
    annotator::Annotator,
    dumper::{Dumper, Inventory, InventorySource},
    metrics::Metrics,
};
