//! The replication table: a tablet of status entries merged with the status
//! combiner.

use anyhow::Context;
use bytes::Bytes;
use holo_combiner::combiner::Entry;
use holo_replication::codec;
use holo_replication::schema::{status_combiner_options, StatusTarget};
use holo_replication::{ProgressRecord, StatusReducer};
use tracing::info;

use crate::kv::FileStore;
use crate::tablet::{CompactionPlan, CompactionSummary, Tablet, TabletConfig};

/// Progress records keyed by (file, table), merged on every read and
/// compaction.
pub struct ReplicationTable<S> {
    tablet: Tablet<S, StatusReducer>,
}

impl<S: FileStore> ReplicationTable<S> {
    /// Open the `replication` tablet over `store` with the status combiner.
    pub fn open(store: S, config: TabletConfig) -> anyhow::Result<Self> {
        let tablet = Tablet::open_with_options(
            "replication",
            store,
            StatusReducer,
            &status_combiner_options(),
            config,
        )?;
        Ok(Self { tablet })
    }

    /// The underlying tablet.
    pub fn tablet(&self) -> &Tablet<S, StatusReducer> {
        &self.tablet
    }

    /// Append one observation for `file` as seen by `table_id`.
    pub fn record(&self, file: &str, table_id: &str, record: &ProgressRecord) -> anyhow::Result<()> {
        self.record_all([(StatusTarget::new(file, table_id), *record)])
    }

    /// Append several observations in one flush.
    pub fn record_all(
        &self,
        observations: impl IntoIterator<Item = (StatusTarget, ProgressRecord)>,
    ) -> anyhow::Result<()> {
        let entries: Vec<Entry> = observations
            .into_iter()
            .map(|(target, record)| Entry::new(target.key(0), codec::encode(&record)))
            .collect();
        self.tablet.write(entries)?;
        Ok(())
    }

    /// Current merged status of one (file, table) pair.
    pub fn status(&self, file: &str, table_id: &str) -> anyhow::Result<Option<ProgressRecord>> {
        let target = StatusTarget::new(file, table_id);
        for entry in self.tablet.scan_row(file.as_bytes())? {
            if StatusTarget::from_key(&entry.key).as_ref() == Some(&target) {
                return decode_status(&target, &entry).map(Some);
            }
        }
        Ok(None)
    }

    /// Every tracked status, ordered by file then table.
    pub fn statuses(&self) -> anyhow::Result<Vec<(StatusTarget, ProgressRecord)>> {
        let mut out = Vec::new();
        for entry in self.tablet.scan()? {
            let Some(target) = StatusTarget::from_key(&entry.key) else {
                continue;
            };
            let record = decode_status(&target, &entry)?;
            out.push((target, record));
        }
        Ok(out)
    }

    /// Delete every status that is closed and fully replicated.
    ///
    /// Producers must not report on a file once it is closed and replicated;
    /// an observation racing this call may be hidden by the marker.
    pub fn remove_completed(&self) -> anyhow::Result<Vec<StatusTarget>> {
        let done: Vec<StatusTarget> = self
            .statuses()?
            .into_iter()
            .filter(|(_, record)| record.is_safe_for_removal())
            .map(|(target, _)| target)
            .collect();
        if done.is_empty() {
            return Ok(done);
        }
        let markers = done
            .iter()
            .map(|target| Entry::new(target.key(0).into_delete(), Bytes::new()))
            .collect();
        self.tablet.write(markers)?;
        info!(removed = done.len(), "removed completed replication statuses");
        Ok(done)
    }

    /// Compact the status tablet. A full pass also drops removed statuses.
    pub fn compact(&self, plan: CompactionPlan) -> anyhow::Result<CompactionSummary> {
        self.tablet.compact(plan)
    }
}

fn decode_status(target: &StatusTarget, entry: &Entry) -> anyhow::Result<ProgressRecord> {
    codec::decode(&entry.value)
        .with_context(|| format!("decode status of {} for table {}", target.file, target.table_id))
}
