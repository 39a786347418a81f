//! Tablet storage for replication status.
//!
//! A `Tablet` keeps sorted entries in immutable files behind a `FileStore`
//! and runs a `Combiner` at every point where entries are rewritten or read:
//! flushes, scans, and partial or full compactions. `ReplicationTable` is a
//! tablet wired to the status combiner.

pub mod kv;
pub mod replication;
pub mod tablet;

pub use kv::{FileId, FileStore, FjallFileStore, MemFileStore};
pub use replication::ReplicationTable;
pub use tablet::{CompactionPlan, CompactionSummary, Tablet, TabletConfig};
