//! Replication progress tracking.
//!
//! Every write-ahead file that must be shipped to a peer cluster gets a
//! status entry in the replication table. Producers append observations
//! (`ProgressRecord`) under the file's row, and the storage engine folds
//! them together through `StatusReducer` whenever it scans or compacts.

pub mod codec;
mod reducer;
pub mod schema;
mod status;

pub use reducer::{status_combiner, StatusReducer};
pub use status::ProgressRecord;
