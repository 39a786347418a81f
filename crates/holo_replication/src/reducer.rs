use holo_combiner::combiner::{Column, ColumnSet, CombineError, Combiner, CombinerConfig, Reducer};

use crate::codec;
use crate::schema::STATUS_FAMILY;
use crate::status::ProgressRecord;

/// Folds encoded `ProgressRecord` values with `ProgressRecord::merge`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusReducer;

impl Reducer for StatusReducer {
    type Value = ProgressRecord;

    fn decode(&self, raw: &[u8]) -> Result<ProgressRecord, CombineError> {
        codec::decode(raw)
    }

    fn encode(&self, value: &ProgressRecord) -> Vec<u8> {
        codec::encode(value)
    }

    fn merge(&self, acc: ProgressRecord, next: ProgressRecord) -> ProgressRecord {
        acc.merge(next)
    }
}

/// Combiner over the replication-status family, one run per (file, table).
pub fn status_combiner() -> Combiner<StatusReducer> {
    let columns = ColumnSet::new([Column::family(STATUS_FAMILY)]);
    Combiner::new(CombinerConfig::for_columns(columns), StatusReducer)
}
