//! Replication progress records.
//!
//! A `ProgressRecord` is one observation about a write-ahead file: how far it
//! has been ingested, how far it has been replicated, and whether it is
//! closed. Observations only ever move forward, so any set of them folds
//! into a single record by taking the pointwise join.

use std::hash::{Hash, Hasher};

/// Progress watermarks for one source file.
///
/// `begin` and `end` are tracked independently: an observation that only
/// reports replication carries `end = 0` and vice versa.
///
/// Equality and hashing look at the close time only through
/// `effective_closed_time`, so a time left on an open record is invisible.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgressRecord {
    /// Offset up to which the file has been replicated.
    pub begin: u64,
    /// Offset up to which the file has been ingested.
    pub end: u64,
    /// The file is still open and its final length is unknown.
    pub infinite_end: bool,
    /// The file will receive no further writes.
    pub closed: bool,
    /// Wall-clock time (unix millis) the file was closed. Only meaningful
    /// when `closed` is set.
    pub closed_time: Option<i64>,
}

impl ProgressRecord {
    pub const fn new_file() -> Self {
        Self {
            begin: 0,
            end: 0,
            infinite_end: false,
            closed: false,
            closed_time: None,
        }
    }

    pub const fn ingested_until(end: u64) -> Self {
        Self::replicated_and_ingested(0, end)
    }

    pub const fn replicated(begin: u64) -> Self {
        Self::replicated_and_ingested(begin, 0)
    }

    pub const fn replicated_and_ingested(begin: u64, end: u64) -> Self {
        Self {
            begin,
            end,
            infinite_end: false,
            closed: false,
            closed_time: None,
        }
    }

    pub const fn file_closed(closed_time: i64) -> Self {
        Self {
            begin: 0,
            end: 0,
            infinite_end: false,
            closed: true,
            closed_time: Some(closed_time),
        }
    }

    /// A file that is still being written and whose length is not yet known.
    pub const fn open_with_unknown_length() -> Self {
        Self {
            begin: 0,
            end: 0,
            infinite_end: true,
            closed: false,
            closed_time: None,
        }
    }

    /// Close time, ignored unless the record is closed.
    pub fn effective_closed_time(&self) -> Option<i64> {
        if self.closed {
            self.closed_time
        } else {
            None
        }
    }

    /// Pointwise join of two observations.
    ///
    /// Watermarks take the maximum, flags are OR'd, and the close time is the
    /// earliest one reported by a closed operand.
    pub fn merge(self, other: Self) -> Self {
        let closed_time = match (self.effective_closed_time(), other.effective_closed_time()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            begin: self.begin.max(other.begin),
            end: self.end.max(other.end),
            infinite_end: self.infinite_end || other.infinite_end,
            closed: self.closed || other.closed,
            closed_time,
        }
    }

    /// True when every ingested byte has been replicated.
    pub fn is_fully_replicated(&self) -> bool {
        if self.infinite_end {
            self.begin == u64::MAX
        } else {
            self.begin >= self.end
        }
    }

    pub fn is_work_required(&self) -> bool {
        !self.is_fully_replicated()
    }

    /// A closed, fully replicated file no longer needs a status entry.
    pub fn is_safe_for_removal(&self) -> bool {
        self.closed && self.is_fully_replicated()
    }
}

impl PartialEq for ProgressRecord {
    fn eq(&self, other: &Self) -> bool {
        self.begin == other.begin
            && self.end == other.end
            && self.infinite_end == other.infinite_end
            && self.closed == other.closed
            && self.effective_closed_time() == other.effective_closed_time()
    }
}

impl Eq for ProgressRecord {}

impl Hash for ProgressRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.begin.hash(state);
        self.end.hash(state);
        self.infinite_end.hash(state);
        self.closed.hash(state);
        self.effective_closed_time().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn fold(records: &[ProgressRecord]) -> ProgressRecord {
        records
            .iter()
            .copied()
            .reduce(ProgressRecord::merge)
            .expect("non-empty fold")
    }

    fn permutations(items: &[ProgressRecord]) -> Vec<Vec<ProgressRecord>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for idx in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(idx);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn new_file_then_ingest() {
        let merged = ProgressRecord::new_file().merge(ProgressRecord::ingested_until(10));
        assert_eq!(merged.begin, 0);
        assert_eq!(merged.end, 10);
        assert!(!merged.closed);
    }

    #[test]
    fn new_file_then_replicate_and_ingest() {
        let merged =
            ProgressRecord::new_file().merge(ProgressRecord::replicated_and_ingested(10, 20));
        assert_eq!(merged.begin, 10);
        assert_eq!(merged.end, 20);
        assert!(!merged.closed);
    }

    #[test]
    fn interleaved_updates_fold_identically_in_every_order() {
        let records = [
            ProgressRecord::new_file(),
            ProgressRecord::ingested_until(100),
            ProgressRecord::replicated(50),
            ProgressRecord::ingested_until(200),
            ProgressRecord::replicated(150),
        ];
        let expected = ProgressRecord::replicated_and_ingested(150, 200);
        let orders = permutations(&records);
        assert_eq!(orders.len(), 120);
        for order in orders {
            assert_eq!(fold(&order), expected, "order: {order:?}");
        }
    }

    #[test]
    fn close_is_kept_in_every_order() {
        let records = [
            ProgressRecord::new_file(),
            ProgressRecord::file_closed(1_700_000_000_000),
            ProgressRecord::ingested_until(200),
        ];
        for order in permutations(&records) {
            let merged = fold(&order);
            assert_eq!(merged.begin, 0);
            assert_eq!(merged.end, 200);
            assert!(merged.closed);
            assert_eq!(merged.closed_time, Some(1_700_000_000_000));
        }
    }

    #[test]
    fn duplicates_do_not_change_the_result() {
        let update = ProgressRecord::ingested_until(100);
        let repl = ProgressRecord::replicated(50);
        let once = fold(&[ProgressRecord::new_file(), update, repl]);
        let repeated = fold(&[ProgressRecord::new_file(), update, repl, update, update, repl]);
        assert_eq!(once, repeated);
    }

    #[test]
    fn earliest_close_time_wins() {
        let a = ProgressRecord::file_closed(500);
        let b = ProgressRecord::file_closed(300);
        assert_eq!(a.merge(b).closed_time, Some(300));
        assert_eq!(b.merge(a).closed_time, Some(300));
    }

    #[test]
    fn close_time_of_open_record_is_ignored() {
        let stray = ProgressRecord {
            closed_time: Some(1),
            ..ProgressRecord::ingested_until(5)
        };
        let merged = stray.merge(ProgressRecord::file_closed(9));
        assert_eq!(merged.closed_time, Some(9));
        assert_eq!(stray.merge(ProgressRecord::new_file()).closed_time, None);
    }

    #[test]
    fn merge_with_itself_ignores_stray_close_time() {
        let stray = ProgressRecord {
            closed_time: Some(1),
            ..ProgressRecord::ingested_until(5)
        };
        assert_eq!(stray.merge(stray), stray);
        assert_eq!(stray, ProgressRecord::ingested_until(5));
        assert_ne!(
            ProgressRecord::file_closed(1),
            ProgressRecord::file_closed(2)
        );

        let hash = |record: &ProgressRecord| {
            let mut hasher = DefaultHasher::new();
            record.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(&stray), hash(&ProgressRecord::ingested_until(5)));
    }

    #[test]
    fn removal_requires_close_and_full_replication() {
        let closed = ProgressRecord::file_closed(1);
        let done = closed.merge(ProgressRecord::replicated_and_ingested(100, 100));
        assert!(done.is_safe_for_removal());

        let lagging = closed.merge(ProgressRecord::replicated_and_ingested(50, 100));
        assert!(lagging.is_work_required());
        assert!(!lagging.is_safe_for_removal());

        let open = ProgressRecord::replicated_and_ingested(100, 100);
        assert!(open.is_fully_replicated());
        assert!(!open.is_safe_for_removal());
    }

    #[test]
    fn unknown_length_needs_max_begin() {
        let open = ProgressRecord::open_with_unknown_length();
        assert!(open.merge(ProgressRecord::replicated(1 << 40)).is_work_required());
        assert!(open
            .merge(ProgressRecord::replicated(u64::MAX))
            .is_fully_replicated());
    }

    fn arb_record() -> impl Strategy<Value = ProgressRecord> {
        (
            any::<u64>(),
            any::<u64>(),
            any::<bool>(),
            any::<bool>(),
            proptest::option::of(any::<i64>()),
        )
            .prop_map(|(begin, end, infinite_end, closed, time)| ProgressRecord {
                begin,
                end,
                infinite_end,
                closed,
                closed_time: time,
            })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_record(), b in arb_record()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
        }

        #[test]
        fn merge_is_associative(a in arb_record(), b in arb_record(), c in arb_record()) {
            prop_assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
        }

        #[test]
        fn merge_is_idempotent(a in arb_record(), repeats in 1usize..5) {
            let mut acc = a;
            for _ in 0..repeats {
                acc = acc.merge(a);
            }
            prop_assert_eq!(acc, a);
        }

        #[test]
        fn fold_ignores_order_and_grouping(
            records in prop::collection::vec(arb_record(), 1..12),
            split in 0usize..12,
        ) {
            let forward = fold(&records);
            let mut reversed = records.clone();
            reversed.reverse();
            prop_assert_eq!(forward, fold(&reversed));

            // Fold two partial groups first, then join the partial results.
            let split = split.min(records.len() - 1) + 1;
            let (left, right) = records.split_at(split);
            let staged = if right.is_empty() {
                fold(left)
            } else {
                fold(left).merge(fold(right))
            };
            prop_assert_eq!(forward, staged);
        }
    }
}
