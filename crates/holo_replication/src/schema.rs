//! Layout of replication-status entries.
//!
//! Row: source file path. Family: `STATUS_FAMILY`. Qualifier: id of the
//! table whose mutations the file holds. Value: an encoded `ProgressRecord`.

use std::collections::BTreeMap;

use holo_combiner::combiner::{CombinerOption, Entry, Key};

use crate::codec;
use crate::status::ProgressRecord;

/// Column family that marks the replication-status namespace.
pub const STATUS_FAMILY: &str = "repl";

/// Coordinates of one status entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusTarget {
    /// Row: the write-ahead file path.
    pub file: String,
    /// Qualifier: the table the file carries data for.
    pub table_id: String,
}

impl StatusTarget {
    pub fn new(file: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            table_id: table_id.into(),
        }
    }

    /// Extract the target from a key in the status family.
    pub fn from_key(key: &Key) -> Option<Self> {
        if key.family != STATUS_FAMILY.as_bytes() {
            return None;
        }
        let file = std::str::from_utf8(&key.row).ok()?;
        let table_id = std::str::from_utf8(&key.qualifier).ok()?;
        Some(Self::new(file, table_id))
    }

    /// Key of this target at `timestamp`.
    pub fn key(&self, timestamp: i64) -> Key {
        Key::new(
            self.file.as_bytes(),
            STATUS_FAMILY.as_bytes(),
            self.table_id.as_bytes(),
        )
        .with_timestamp(timestamp)
    }
}

/// Build one observation entry.
pub fn status_entry(file: &str, table_id: &str, timestamp: i64, record: &ProgressRecord) -> Entry {
    Entry::new(
        StatusTarget::new(file, table_id).key(timestamp),
        codec::encode(record),
    )
}

/// Setup options selecting the status family for a combiner.
pub fn status_combiner_options() -> BTreeMap<String, String> {
    BTreeMap::from([(
        CombinerOption::Columns.key().to_string(),
        STATUS_FAMILY.to_string(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_round_trips_through_key() {
        let target = StatusTarget::new("hdfs://nn/wal/tserver+9997/abc", "3");
        let key = target.key(17);
        assert_eq!(key.timestamp, 17);
        assert_eq!(StatusTarget::from_key(&key), Some(target));
    }

    #[test]
    fn keys_outside_status_family_have_no_target() {
        let key = Key::new("/wal/f1", "work", "3");
        assert_eq!(StatusTarget::from_key(&key), None);
    }

    #[test]
    fn status_entry_encodes_record() {
        let entry = status_entry("/wal/f1", "3", 5, &ProgressRecord::replicated(9));
        let decoded = codec::decode(&entry.value).expect("decode");
        assert_eq!(decoded, ProgressRecord::replicated(9));
    }
}
