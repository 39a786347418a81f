//! Entry keys, their total order, and the reduction-key projection.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

/// Timestamp carried by a masked reduction key.
const MASKED_TIMESTAMP: i64 = i64::MAX;

/// Full key of a stored entry.
///
/// Keys sort by row, family, qualifier and visibility ascending, then by
/// timestamp descending (newest first). At identical coordinates a delete
/// marker sorts before the live entry it shadows.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub row: Vec<u8>,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub visibility: Vec<u8>,
    pub timestamp: i64,
    pub deleted: bool,
}

/// Components retained by the reduction key. The timestamp is always masked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroupBy {
    /// Retain row, family, qualifier and visibility.
    #[default]
    Column,
    /// Retain row and family only.
    Family,
}

impl GroupBy {
    /// Option value naming this granularity.
    pub fn as_str(self) -> &'static str {
        match self {
            GroupBy::Column => "column",
            GroupBy::Family => "family",
        }
    }

    /// Parse an option value, ignoring case and surrounding whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "column" => Some(GroupBy::Column),
            "family" => Some(GroupBy::Family),
            _ => None,
        }
    }
}

impl Key {
    /// Key for a column with empty visibility at the newest timestamp.
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Vec::new(),
            timestamp: MASKED_TIMESTAMP,
            deleted: false,
        }
    }

    /// Replace the visibility label.
    pub fn with_visibility(mut self, visibility: impl Into<Vec<u8>>) -> Self {
        self.visibility = visibility.into();
        self
    }

    /// Replace the timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Turn this key into a delete marker for the same coordinates.
    pub fn into_delete(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// True when both keys share row, family, qualifier and visibility.
    pub fn same_column(&self, other: &Key) -> bool {
        self.row == other.row
            && self.family == other.family
            && self.qualifier == other.qualifier
            && self.visibility == other.visibility
    }

    /// Project this key onto its reduction key: masked components are set to
    /// fixed values, so two keys are mergeable iff their projections are equal.
    pub fn reduction_key(&self, group_by: GroupBy) -> Key {
        let (qualifier, visibility) = match group_by {
            GroupBy::Column => (self.qualifier.clone(), self.visibility.clone()),
            GroupBy::Family => (Vec::new(), Vec::new()),
        };
        Key {
            row: self.row.clone(),
            family: self.family.clone(),
            qualifier,
            visibility,
            timestamp: MASKED_TIMESTAMP,
            deleted: false,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.deleted.cmp(&self.deleted))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} [{}] {}",
            String::from_utf8_lossy(&self.row),
            String::from_utf8_lossy(&self.family),
            String::from_utf8_lossy(&self.qualifier),
            String::from_utf8_lossy(&self.visibility),
            self.timestamp
        )?;
        if self.deleted {
            f.write_str(" (delete)")?;
        }
        Ok(())
    }
}

/// One key/value pair of the sorted entry stream.
///
/// The value is a shared buffer: entries that pass through the driver keep
/// pointing at the exact bytes they arrived with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub value: Bytes,
}

impl Entry {
    /// Pair a key with a value, taking the value's buffer without copying.
    pub fn new(key: Key, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_timestamps_sort_first() {
        let older = Key::new("r", "f", "q").with_timestamp(5);
        let newer = Key::new("r", "f", "q").with_timestamp(9);
        assert!(newer < older);
    }

    #[test]
    fn columns_sort_before_timestamps() {
        let a = Key::new("r", "f", "a").with_timestamp(1);
        let b = Key::new("r", "f", "b").with_timestamp(100);
        assert!(a < b);
        let other_row = Key::new("s", "a", "a").with_timestamp(i64::MAX);
        assert!(b < other_row);
    }

    #[test]
    fn delete_marker_sorts_before_live_entry() {
        let live = Key::new("r", "f", "q").with_timestamp(7);
        let marker = live.clone().into_delete();
        assert!(marker < live);
    }

    #[test]
    fn family_grouping_masks_qualifier_and_visibility() {
        let a = Key::new("r", "f", "a").with_visibility("x").with_timestamp(1);
        let b = Key::new("r", "f", "b").with_timestamp(2);
        assert_eq!(
            a.reduction_key(GroupBy::Family),
            b.reduction_key(GroupBy::Family)
        );
        assert_ne!(
            a.reduction_key(GroupBy::Column),
            b.reduction_key(GroupBy::Column)
        );
    }

    #[test]
    fn column_grouping_masks_timestamp() {
        let a = Key::new("r", "f", "q").with_timestamp(1);
        let b = Key::new("r", "f", "q").with_timestamp(2);
        assert_eq!(
            a.reduction_key(GroupBy::Column),
            b.reduction_key(GroupBy::Column)
        );
    }

    #[test]
    fn group_by_parses_known_names() {
        assert_eq!(GroupBy::parse("Family"), Some(GroupBy::Family));
        assert_eq!(GroupBy::parse(" column "), Some(GroupBy::Column));
        assert_eq!(GroupBy::parse("row"), None);
    }
}
