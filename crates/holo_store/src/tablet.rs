//! A tablet: sorted entries in immutable files, combined on every rewrite.
//!
//! Writes are stamped from a per-tablet clock that never goes backwards and
//! are flushed one batch per file, so the file list is ordered by time as
//! well as by age. Compactions only ever take a prefix of that list (or all
//! of it), which keeps delete markers outside the selection newer than
//! everything inside it.
//!
//! Delete markers hide entries of the same column with a timestamp at or
//! below their own. Flushes and partial compactions keep the markers since
//! covered data may still sit in other files; full compactions and scans
//! drop them.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use holo_combiner::combiner::{
    CombineError, Combiner, Entry, Key, ReduceContext, ReducePhase, Reducer,
};
use tracing::{debug, info, warn};

use crate::kv::{FileId, FileStore};

/// Default number of files a tablet holds before compacting automatically.
const DEFAULT_MAX_FILES: usize = 8;
/// Default number of oldest files merged by an automatic compaction.
const DEFAULT_COMPACT_FANOUT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TabletConfig {
    /// File count above which a write triggers a partial compaction.
    pub max_files: usize,
    /// Oldest files merged by that compaction.
    pub compact_fanout: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            compact_fanout: DEFAULT_COMPACT_FANOUT,
        }
    }
}

impl TabletConfig {
    /// Read overrides from `HOLO_STATUS_MAX_FILES` and
    /// `HOLO_STATUS_COMPACT_FANOUT`.
    pub fn from_env() -> Self {
        Self {
            max_files: read_env_usize("HOLO_STATUS_MAX_FILES", DEFAULT_MAX_FILES).max(1),
            compact_fanout: read_env_usize("HOLO_STATUS_COMPACT_FANOUT", DEFAULT_COMPACT_FANOUT)
                .max(2),
        }
    }
}

/// Which files a compaction rewrites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionPlan {
    /// The `n` oldest files. Selecting every file makes it a full pass.
    Partial(usize),
    Full,
}

/// What a compaction read and wrote. All zeros when nothing was selected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub input_files: usize,
    pub input_entries: usize,
    pub output_entries: usize,
    pub output_file: Option<FileId>,
    pub full: bool,
}

/// Sorted files over a `FileStore`, rewritten through a `Combiner`.
pub struct Tablet<S, R> {
    name: String,
    store: S,
    combiner: Combiner<R>,
    config: TabletConfig,
    clock: AtomicI64,
    /// Serializes stamping and flushing so file order follows timestamps.
    write_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    /// Held shared by readers and exclusively while files are removed.
    files_lock: RwLock<()>,
}

impl<S: FileStore, R: Reducer> Tablet<S, R> {
    /// Open a tablet over whatever files `store` already holds.
    pub fn open(
        name: impl Into<String>,
        store: S,
        combiner: Combiner<R>,
        config: TabletConfig,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let files = store.list_files().context("list tablet files")?;
        let mut newest = i64::MIN;
        for id in &files {
            let entries = store
                .read_file(*id)
                .with_context(|| format!("read file {id} of tablet {name}"))?;
            if let Some(max) = entries.iter().map(|entry| entry.key.timestamp).max() {
                newest = newest.max(max);
            }
        }
        debug!(
            tablet = %name,
            files = files.len(),
            newest,
            options = ?combiner.config().to_options(),
            "opened tablet"
        );
        Ok(Self {
            name,
            store,
            combiner,
            config,
            clock: AtomicI64::new(newest),
            write_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            files_lock: RwLock::new(()),
        })
    }

    /// Open a tablet whose combiner is built from setup options.
    ///
    /// The combiner's context carries the tablet name as the `tablet`
    /// setting.
    pub fn open_with_options(
        name: impl Into<String>,
        store: S,
        reducer: R,
        options: &BTreeMap<String, String>,
        config: TabletConfig,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let ctx = ReduceContext::scan().with_setting("tablet", name.clone());
        let combiner =
            Combiner::init(reducer, options, &ctx).context("initialize tablet combiner")?;
        Self::open(name, store, combiner, config)
    }

    /// Name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compaction tuning in effect.
    pub fn config(&self) -> TabletConfig {
        self.config
    }

    /// The combiner applied on flush, scan and compaction.
    pub fn combiner(&self) -> &Combiner<R> {
        &self.combiner
    }

    /// Number of live files.
    pub fn file_count(&self) -> anyhow::Result<usize> {
        Ok(self.store.list_files()?.len())
    }

    /// Write one value. Returns the timestamp it was stamped with.
    pub fn put(&self, key: Key, value: impl Into<Bytes>) -> anyhow::Result<i64> {
        let stamps = self.write(vec![Entry::new(key, value)])?;
        Ok(stamps[0])
    }

    /// Write a delete marker for `key`'s column.
    pub fn delete(&self, key: Key) -> anyhow::Result<i64> {
        let stamps = self.write(vec![Entry::new(key.into_delete(), Bytes::new())])?;
        Ok(stamps[0])
    }

    /// Flush a batch as one new file.
    ///
    /// Every entry gets a fresh timestamp, in batch order, overriding
    /// whatever the caller set. The batch is combined in minor-compaction
    /// scope before it is stored. Returns the assigned timestamps.
    pub fn write(&self, entries: Vec<Entry>) -> anyhow::Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let count = entries.len();
        let (stamps, file_id, stored) = {
            let _guard = self
                .write_lock
                .lock()
                .map_err(|_| anyhow::anyhow!("tablet write lock poisoned"))?;
            let mut stamps = Vec::with_capacity(count);
            let mut stamped = Vec::with_capacity(count);
            for mut entry in entries {
                entry.key.timestamp = self.next_timestamp();
                stamps.push(entry.key.timestamp);
                stamped.push(entry);
            }
            sort_entries(&mut stamped);
            let flushed = self
                .combine(ReducePhase::MinorCompaction, false, suppress_deleted(stamped, true))
                .with_context(|| format!("combine flush for tablet {}", self.name))?;
            let stored = flushed.len();
            let file_id = self.store.allocate_file_id()?;
            self.store
                .add_file(file_id, flushed)
                .with_context(|| format!("store flushed file for tablet {}", self.name))?;
            (stamps, file_id, stored)
        };
        debug!(tablet = %self.name, file_id, written = count, stored, "flushed batch");
        self.maybe_compact();
        Ok(stamps)
    }

    /// Every live entry, combined. Delete markers and the data they cover
    /// are not returned.
    pub fn scan(&self) -> anyhow::Result<Vec<Entry>> {
        self.scan_where(|_| true)
    }

    /// Live entries of one row, combined.
    pub fn scan_row(&self, row: &[u8]) -> anyhow::Result<Vec<Entry>> {
        self.scan_where(|key| key.row == row)
    }

    fn scan_where(&self, keep: impl Fn(&Key) -> bool) -> anyhow::Result<Vec<Entry>> {
        let mut entries = {
            let _guard = self
                .files_lock
                .read()
                .map_err(|_| anyhow::anyhow!("tablet files lock poisoned"))?;
            let mut entries = Vec::new();
            for id in self.store.list_files()? {
                let file = self
                    .store
                    .read_file(id)
                    .with_context(|| format!("read file {id} of tablet {}", self.name))?;
                entries.extend(file.into_iter().filter(|entry| keep(&entry.key)));
            }
            entries
        };
        sort_entries(&mut entries);
        self.combine(ReducePhase::Scan, false, suppress_deleted(entries, false))
            .with_context(|| format!("scan tablet {}", self.name))
    }

    /// Merge files through the combiner into one file.
    ///
    /// On failure the file set is left untouched and the error returned.
    pub fn compact(&self, plan: CompactionPlan) -> anyhow::Result<CompactionSummary> {
        let _guard = self
            .compaction_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("tablet compaction lock poisoned"))?;
        self.compact_locked(plan)
    }

    fn maybe_compact(&self) {
        let files = match self.store.list_files() {
            Ok(files) => files.len(),
            Err(err) => {
                warn!(tablet = %self.name, error = ?err, "failed to list files after flush");
                return;
            }
        };
        if files <= self.config.max_files {
            return;
        }
        // Another thread is already compacting this tablet.
        let Ok(guard) = self.compaction_lock.try_lock() else {
            return;
        };
        if let Err(err) = self.compact_locked(CompactionPlan::Partial(self.config.compact_fanout)) {
            warn!(tablet = %self.name, files, error = ?err, "automatic compaction failed");
        }
        drop(guard);
    }

    fn compact_locked(&self, plan: CompactionPlan) -> anyhow::Result<CompactionSummary> {
        let files = self.store.list_files()?;
        let selected: Vec<FileId> = match plan {
            CompactionPlan::Partial(n) => files.iter().take(n).copied().collect(),
            CompactionPlan::Full => files.clone(),
        };
        let full = !selected.is_empty() && selected.len() == files.len();
        if selected.is_empty() || (!full && selected.len() < 2) {
            return Ok(CompactionSummary {
                full,
                ..CompactionSummary::default()
            });
        }

        let result = self.rewrite(&selected, full);
        match &result {
            Ok(summary) => info!(
                tablet = %self.name,
                input_files = summary.input_files,
                input_entries = summary.input_entries,
                output_entries = summary.output_entries,
                full,
                "compacted files"
            ),
            Err(err) => warn!(
                tablet = %self.name,
                files = selected.len(),
                full,
                bad_value = err
                    .downcast_ref::<CombineError>()
                    .is_some_and(CombineError::is_decode_error),
                error = ?err,
                "compaction failed; input files kept"
            ),
        }
        result
    }

    fn rewrite(&self, selected: &[FileId], full: bool) -> anyhow::Result<CompactionSummary> {
        let mut entries = Vec::new();
        for id in selected {
            entries.extend(
                self.store
                    .read_file(*id)
                    .with_context(|| format!("read file {id} for compaction"))?,
            );
        }
        let input_entries = entries.len();
        sort_entries(&mut entries);
        let output = self
            .combine(ReducePhase::MajorCompaction, full, suppress_deleted(entries, !full))
            .with_context(|| format!("combine compaction of {} files", selected.len()))?;
        let output_entries = output.len();

        let output_file = if output.is_empty() {
            None
        } else {
            Some(self.store.allocate_file_id()?)
        };
        {
            let _guard = self
                .files_lock
                .write()
                .map_err(|_| anyhow::anyhow!("tablet files lock poisoned"))?;
            self.store
                .replace_files(selected, output_file.map(|id| (id, output)))
                .context("swap compacted files")?;
        }
        Ok(CompactionSummary {
            input_files: selected.len(),
            input_entries,
            output_entries,
            output_file,
            full,
        })
    }

    /// Run the combiner under the setup context switched to `phase`.
    fn combine(
        &self,
        phase: ReducePhase,
        full: bool,
        entries: Vec<Entry>,
    ) -> anyhow::Result<Vec<Entry>> {
        let ctx = self.combiner.context().in_phase(phase, full);
        Ok(self.combiner.combine_all_in(&ctx, entries)?)
    }

    fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        let mut current = self.clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(current.saturating_add(1));
            match self
                .clock
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
}

/// Drop entries hidden by a delete marker of the same column.
///
/// Input must be sorted: a column's newest marker then precedes every entry
/// it covers.
fn suppress_deleted(entries: Vec<Entry>, keep_markers: bool) -> Vec<Entry> {
    let mut out = Vec::with_capacity(entries.len());
    let mut marker: Option<Key> = None;
    for entry in entries {
        if entry.key.deleted {
            let newer = match &marker {
                Some(current) if current.same_column(&entry.key) => false,
                _ => true,
            };
            if newer {
                marker = Some(entry.key.clone());
            }
            if keep_markers {
                out.push(entry);
            }
            continue;
        }
        if let Some(current) = &marker {
            if current.same_column(&entry.key) && entry.key.timestamp <= current.timestamp {
                continue;
            }
        }
        out.push(entry);
    }
    out
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}
