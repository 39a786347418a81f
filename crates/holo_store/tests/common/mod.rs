//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Once};

use holo_replication::ProgressRecord;
use holo_store::{FjallFileStore, MemFileStore, ReplicationTable, TabletConfig};

static TRACING: Once = Once::new();

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

/// Config that never compacts on its own.
pub fn manual_compaction() -> TabletConfig {
    TabletConfig {
        max_files: usize::MAX,
        compact_fanout: 2,
    }
}

pub fn mem_table(config: TabletConfig) -> ReplicationTable<MemFileStore> {
    init_tracing();
    ReplicationTable::open(MemFileStore::new(), config).expect("open in-memory table")
}

/// Open (or reopen) a fjall-backed table rooted at `dir`.
pub fn fjall_table(dir: &Path, config: TabletConfig) -> ReplicationTable<FjallFileStore> {
    init_tracing();
    let keyspace = fjall::Config::new(dir).open().expect("open keyspace");
    let store = FjallFileStore::open(Arc::new(keyspace), "replication")
        .expect("open file store")
        .with_persist_mode(Some(fjall::PersistMode::SyncAll));
    ReplicationTable::open(store, config).expect("open fjall table")
}

/// Fold observations the way the table is expected to.
pub fn fold(records: &[ProgressRecord]) -> Option<ProgressRecord> {
    records.iter().copied().reduce(ProgressRecord::merge)
}
