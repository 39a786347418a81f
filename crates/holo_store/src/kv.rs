//! Immutable sorted files backing a tablet.
//!
//! A tablet's data lives in an ordered list of files, oldest first. Files are
//! never modified: flushes append a new file and compactions atomically swap
//! a set of input files for one output file placed where the first input
//! was. Keeping the list in age order is what lets partial compactions pick
//! a prefix of it safely.

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use holo_combiner::combiner::{Entry, Key};

pub type FileId = u64;

/// Storage for a tablet's immutable files.
pub trait FileStore: Send + Sync + 'static {
    /// Live files in age order, oldest first.
    fn list_files(&self) -> anyhow::Result<Vec<FileId>>;
    /// Entries of a live file in storage order. Fails for removed ids.
    fn read_file(&self, id: FileId) -> anyhow::Result<Vec<Entry>>;
    /// Reserve an id no earlier file has used.
    fn allocate_file_id(&self) -> anyhow::Result<FileId>;
    /// Atomically drop `remove` and add `add`.
    ///
    /// The new file takes the list position of the first removed file, or is
    /// appended when nothing is removed. Fails without changes if any file in
    /// `remove` is not live.
    fn replace_files(&self, remove: &[FileId], add: Option<(FileId, Vec<Entry>)>)
        -> anyhow::Result<()>;

    /// Append a new newest file.
    fn add_file(&self, id: FileId, entries: Vec<Entry>) -> anyhow::Result<()> {
        self.replace_files(&[], Some((id, entries)))
    }
}

/// Insert `add` into `files` in place of `remove`, preserving age order.
fn splice_file_list(
    files: &[FileId],
    remove: &[FileId],
    add: Option<FileId>,
) -> anyhow::Result<Vec<FileId>> {
    for id in remove {
        anyhow::ensure!(files.contains(id), "file {id} is not live");
    }
    let mut out = Vec::with_capacity(files.len() + 1);
    let mut placed = add.is_none();
    for id in files {
        if remove.contains(id) {
            if !placed {
                out.extend(add);
                placed = true;
            }
            continue;
        }
        out.push(*id);
    }
    if !placed {
        out.extend(add);
    }
    Ok(out)
}

#[derive(Default)]
struct MemFiles {
    order: Vec<FileId>,
    files: HashMap<FileId, Arc<Vec<Entry>>>,
}

/// In-memory file store, mainly for tests and ephemeral tablets.
#[derive(Default)]
pub struct MemFileStore {
    inner: RwLock<MemFiles>,
    next_id: AtomicU64,
}

impl MemFileStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemFileStore {
    fn list_files(&self) -> anyhow::Result<Vec<FileId>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("mem file store lock poisoned"))?;
        Ok(guard.order.clone())
    }

    fn read_file(&self, id: FileId) -> anyhow::Result<Vec<Entry>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| anyhow::anyhow!("mem file store lock poisoned"))?;
        let file = guard
            .files
            .get(&id)
            .with_context(|| format!("file {id} is not live"))?;
        Ok(file.as_ref().clone())
    }

    fn allocate_file_id(&self) -> anyhow::Result<FileId> {
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn replace_files(
        &self,
        remove: &[FileId],
        add: Option<(FileId, Vec<Entry>)>,
    ) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("mem file store lock poisoned"))?;
        let order = splice_file_list(&guard.order, remove, add.as_ref().map(|(id, _)| *id))?;
        for id in remove {
            guard.files.remove(id);
        }
        if let Some((id, entries)) = add {
            guard.files.insert(id, Arc::new(entries));
        }
        guard.order = order;
        Ok(())
    }
}

const MANIFEST_FILES_KEY: &[u8] = b"files";
const MANIFEST_NEXT_ID_KEY: &[u8] = b"next_file_id";

/// Fjall-backed file store.
///
/// Entries live in `{name}_files` keyed by file id and position within the
/// file; the ordered file list and id allocator live in `{name}_manifest`.
/// Every replacement is one fjall batch.
pub struct FjallFileStore {
    keyspace: Arc<Keyspace>,
    files: fjall::PartitionHandle,
    manifest: fjall::PartitionHandle,
    persist_mode: Option<PersistMode>,
    lock: RwLock<()>,
    next_id: AtomicU64,
}

impl FjallFileStore {
    /// Open (or create) the partitions for tablet `name` and load its
    /// manifest. Persistence defaults to `HOLO_STATUS_PERSIST_MODE`.
    pub fn open(keyspace: Arc<Keyspace>, name: &str) -> anyhow::Result<Self> {
        let files = keyspace.open_partition(&format!("{name}_files"), PartitionCreateOptions::default())?;
        let manifest =
            keyspace.open_partition(&format!("{name}_manifest"), PartitionCreateOptions::default())?;
        let next_id = match manifest.get(MANIFEST_NEXT_ID_KEY)? {
            Some(bytes) => {
                let mut offset = 0usize;
                read_u64(&bytes, &mut offset).context("decode next file id")?
            }
            None => 0,
        };
        Ok(Self {
            keyspace,
            files,
            manifest,
            persist_mode: parse_persist_mode(env::var("HOLO_STATUS_PERSIST_MODE").ok().as_deref()),
            lock: RwLock::new(()),
            next_id: AtomicU64::new(next_id),
        })
    }

    /// Override the persistence applied after each replacement.
    pub fn with_persist_mode(mut self, mode: Option<PersistMode>) -> Self {
        self.persist_mode = mode;
        self
    }

    fn load_file_list(&self) -> anyhow::Result<Vec<FileId>> {
        match self.manifest.get(MANIFEST_FILES_KEY)? {
            Some(bytes) => decode_file_list(&bytes),
            None => Ok(Vec::new()),
        }
    }
}

impl FileStore for FjallFileStore {
    fn list_files(&self) -> anyhow::Result<Vec<FileId>> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow::anyhow!("fjall file store lock poisoned"))?;
        self.load_file_list()
    }

    fn read_file(&self, id: FileId) -> anyhow::Result<Vec<Entry>> {
        let _guard = self
            .lock
            .read()
            .map_err(|_| anyhow::anyhow!("fjall file store lock poisoned"))?;
        anyhow::ensure!(self.load_file_list()?.contains(&id), "file {id} is not live");
        let mut out = Vec::new();
        for item in self.files.prefix(id.to_be_bytes()) {
            let (_, value) = item?;
            out.push(decode_entry(&value).with_context(|| format!("decode entry of file {id}"))?);
        }
        Ok(out)
    }

    fn allocate_file_id(&self) -> anyhow::Result<FileId> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("fjall file store lock poisoned"))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.manifest
            .insert(MANIFEST_NEXT_ID_KEY, (id + 1).to_be_bytes().to_vec())
            .context("persist next file id")?;
        Ok(id)
    }

    fn replace_files(
        &self,
        remove: &[FileId],
        add: Option<(FileId, Vec<Entry>)>,
    ) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .write()
            .map_err(|_| anyhow::anyhow!("fjall file store lock poisoned"))?;
        let current = self.load_file_list()?;
        let order = splice_file_list(&current, remove, add.as_ref().map(|(id, _)| *id))?;

        // Snapshot the keys to delete before mutating the partition.
        let mut doomed = Vec::new();
        for id in remove {
            for item in self.files.prefix(id.to_be_bytes()) {
                let (key, _) = item?;
                doomed.push(key.to_vec());
            }
        }

        let mut batch = self.keyspace.batch();
        for key in doomed {
            batch.remove(&self.files, key);
        }
        if let Some((id, entries)) = add {
            for (pos, entry) in entries.iter().enumerate() {
                batch.insert(&self.files, encode_file_key(id, pos as u64), encode_entry(entry));
            }
        }
        batch.insert(&self.manifest, MANIFEST_FILES_KEY, encode_file_list(&order));
        batch.commit().context("commit file replacement")?;

        if let Some(mode) = self.persist_mode {
            self.keyspace
                .persist(mode)
                .context("persist keyspace after file replacement")?;
        }
        Ok(())
    }
}

/// Parse the requested persistence mode from a string.
fn parse_persist_mode(value: Option<&str>) -> Option<PersistMode> {
    match value.map(|v| v.to_ascii_lowercase()) {
        // "none" and "buffer" rely on fjall's own journal flushing.
        Some(v) if v == "none" || v == "buffer" => None,
        Some(v) if v == "sync_data" => Some(PersistMode::SyncData),
        Some(v) if v == "sync_all" => Some(PersistMode::SyncAll),
        // Unknown strings default to the safest mode.
        Some(_) => Some(PersistMode::SyncAll),
        None => None,
    }
}

fn encode_file_key(id: FileId, pos: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&pos.to_be_bytes());
    out
}

fn encode_file_list(files: &[FileId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + files.len() * 8);
    out.extend_from_slice(&(files.len() as u32).to_be_bytes());
    for id in files {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

fn decode_file_list(data: &[u8]) -> anyhow::Result<Vec<FileId>> {
    let mut offset = 0usize;
    let count = read_u32(data, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_u64(data, &mut offset)?);
    }
    anyhow::ensure!(offset == data.len(), "trailing bytes in file list");
    Ok(out)
}

fn encode_entry(entry: &Entry) -> Vec<u8> {
    let key = &entry.key;
    let mut out = Vec::with_capacity(
        4 * 5
            + key.row.len()
            + key.family.len()
            + key.qualifier.len()
            + key.visibility.len()
            + 8
            + 1
            + entry.value.len(),
    );
    for part in [&key.row, &key.family, &key.qualifier, &key.visibility] {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out.extend_from_slice(&key.timestamp.to_be_bytes());
    out.push(key.deleted as u8);
    out.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
    out.extend_from_slice(&entry.value);
    out
}

fn decode_entry(data: &[u8]) -> anyhow::Result<Entry> {
    let mut offset = 0usize;
    let row = read_bytes(data, &mut offset)?;
    let family = read_bytes(data, &mut offset)?;
    let qualifier = read_bytes(data, &mut offset)?;
    let visibility = read_bytes(data, &mut offset)?;
    let timestamp = read_u64(data, &mut offset)? as i64;
    let deleted = read_u8(data, &mut offset)? != 0;
    let value = read_bytes(data, &mut offset)?;
    anyhow::ensure!(offset == data.len(), "trailing bytes in entry");
    Ok(Entry {
        key: Key {
            row,
            family,
            qualifier,
            visibility,
            timestamp,
            deleted,
        },
        value: Bytes::from(value),
    })
}

fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short byte field");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(row: &str, ts: i64, value: &'static [u8]) -> Entry {
        Entry::new(Key::new(row, "repl", "1").with_timestamp(ts), value)
    }

    fn open_fjall(dir: &std::path::Path) -> FjallFileStore {
        let keyspace = fjall::Config::new(dir)
            .open()
            .expect("open temporary keyspace");
        FjallFileStore::open(Arc::new(keyspace), "status")
            .expect("open file store")
            .with_persist_mode(None)
    }

    #[test]
    fn splice_keeps_age_order() {
        let files = [1, 2, 3, 4];
        assert_eq!(
            splice_file_list(&files, &[1, 2], Some(9)).expect("splice"),
            vec![9, 3, 4]
        );
        assert_eq!(
            splice_file_list(&files, &[], Some(9)).expect("splice"),
            vec![1, 2, 3, 4, 9]
        );
        assert_eq!(
            splice_file_list(&files, &[2, 4], None).expect("splice"),
            vec![1, 3]
        );
        assert!(splice_file_list(&files, &[7], Some(9)).is_err());
    }

    #[test]
    fn mem_store_replaces_files_atomically() {
        let store = MemFileStore::new();
        let a = store.allocate_file_id().expect("id");
        let b = store.allocate_file_id().expect("id");
        store.add_file(a, vec![entry("r1", 2, b"x")]).expect("add a");
        store.add_file(b, vec![entry("r2", 1, b"y")]).expect("add b");

        let c = store.allocate_file_id().expect("id");
        assert!(store
            .replace_files(&[a, 42], Some((c, Vec::new())))
            .is_err());
        assert_eq!(store.list_files().expect("list"), vec![a, b]);

        store
            .replace_files(&[a, b], Some((c, vec![entry("r1", 2, b"z")])))
            .expect("replace");
        assert_eq!(store.list_files().expect("list"), vec![c]);
        assert!(store.read_file(a).is_err());
        assert_eq!(store.read_file(c).expect("read")[0].value, Bytes::from_static(b"z"));
    }

    #[test]
    fn entry_encoding_preserves_every_field() {
        let original = Entry::new(
            Key::new("row", "fam", "qual")
                .with_visibility("vis")
                .with_timestamp(-5)
                .into_delete(),
            &b"value"[..],
        );
        let decoded = decode_entry(&encode_entry(&original)).expect("decode entry");
        assert_eq!(decoded, original);
        assert!(decode_entry(&encode_entry(&original)[..10]).is_err());
    }

    #[test]
    fn fjall_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (a, b) = {
            let store = open_fjall(dir.path());
            let a = store.allocate_file_id().expect("id");
            store
                .add_file(a, vec![entry("r1", 3, b"one"), entry("r1", 1, b"two")])
                .expect("add a");
            let b = store.allocate_file_id().expect("id");
            store.add_file(b, vec![entry("r2", 4, b"three")]).expect("add b");
            (a, b)
        };

        let store = open_fjall(dir.path());
        assert_eq!(store.list_files().expect("list"), vec![a, b]);
        let first = store.read_file(a).expect("read a");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].key.timestamp, 3);
        assert_eq!(first[1].value, Bytes::from_static(b"two"));

        let c = store.allocate_file_id().expect("id");
        assert!(c > b);
        store
            .replace_files(&[a], Some((c, vec![entry("r1", 3, b"merged")])))
            .expect("replace");
        assert_eq!(store.list_files().expect("list"), vec![c, b]);
        assert!(store.read_file(a).is_err());
        assert!(store.files.prefix(a.to_be_bytes()).next().is_none());
    }

    #[test]
    fn persist_mode_parsing() {
        assert!(parse_persist_mode(None).is_none());
        assert!(parse_persist_mode(Some("buffer")).is_none());
        assert!(matches!(
            parse_persist_mode(Some("SYNC_DATA")),
            Some(PersistMode::SyncData)
        ));
        assert!(matches!(
            parse_persist_mode(Some("bogus")),
            Some(PersistMode::SyncAll)
        ));
    }
}
