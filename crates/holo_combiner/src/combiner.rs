//! Combiner module wiring.
//!
//! `key` defines the sortable entry key and its reduction-key projection,
//! `columns` and `config` parse the significant-column selection, `context`
//! carries the per-invocation environment, `error` holds the failure
//! taxonomy, and `driver` implements the run-folding iterator itself.

mod columns;
mod config;
mod context;
mod driver;
mod error;
mod key;

pub use columns::{Column, ColumnSet};
pub use config::{ColumnSelection, CombinerConfig, CombinerOption};
pub use context::{ReduceContext, ReducePhase};
pub use driver::{Combined, Combiner, Reducer};
pub use error::CombineError;
pub use key::{Entry, GroupBy, Key};
