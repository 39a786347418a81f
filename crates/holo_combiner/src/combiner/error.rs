use thiserror::Error;

use super::key::Key;

/// Failures surfaced by setup, decoding, and run reduction.
///
/// None of these are retried by the combiner. A run either yields exactly
/// one output entry or fails as a whole.
#[derive(Debug, Error)]
pub enum CombineError {
    /// A stored value carries a version tag this build cannot read.
    #[error("unsupported record version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// The version tag matched but the payload is structurally invalid.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// A run with no values reached the reducer. Unreachable unless the
    /// grouping logic itself is broken.
    #[error("attempted to reduce an empty run")]
    EmptyRun,

    /// Input keys decreased between two adjacent entries.
    #[error("input is not sorted: {next} follows {previous}")]
    UnsortedInput { previous: Box<Key>, next: Box<Key> },

    /// A required setup option was not supplied.
    #[error("missing required option '{0}'")]
    MissingOption(&'static str),

    /// A setup option was supplied with an unusable value.
    #[error("invalid value for option '{option}': {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },
}

impl CombineError {
    /// A value that could not be decoded.
    pub fn malformed(reason: impl Into<String>) -> Self {
        CombineError::MalformedRecord(reason.into())
    }

    /// True for errors caused by a stored value rather than by setup or by
    /// the shape of the input stream.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            CombineError::UnsupportedVersion { .. } | CombineError::MalformedRecord(_)
        )
    }
}
