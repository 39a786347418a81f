//! Validated combiner configuration.
//!
//! Options arrive once at setup as a string map. Recognized keys are parsed
//! into a `CombinerConfig` that never changes afterwards; anything else in
//! the map is ignored.

use std::collections::BTreeMap;

use tracing::debug;

use super::columns::ColumnSet;
use super::error::CombineError;
use super::key::{GroupBy, Key};

/// Option keys understood by `CombinerConfig::from_options`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombinerOption {
    /// Comma-separated `family[:qualifier]` list of significant columns.
    Columns,
    /// `true` makes every column significant.
    All,
    /// Reduction-key granularity: `column` or `family`.
    GroupBy,
}

impl CombinerOption {
    pub const ALL: [CombinerOption; 3] = [
        CombinerOption::Columns,
        CombinerOption::All,
        CombinerOption::GroupBy,
    ];

    /// Key under which this option appears in a setup map.
    pub fn key(self) -> &'static str {
        match self {
            CombinerOption::Columns => "columns",
            CombinerOption::All => "all",
            CombinerOption::GroupBy => "reduce-scope",
        }
    }

    /// Look up an option key. `significant-columns` is accepted as a
    /// long form of `columns`.
    pub fn parse(key: &str) -> Option<Self> {
        if key == "significant-columns" {
            return Some(CombinerOption::Columns);
        }
        Self::ALL.into_iter().find(|option| option.key() == key)
    }
}

/// Which entries participate in grouping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnSelection {
    All,
    Only(ColumnSet),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CombinerConfig {
    columns: ColumnSelection,
    group_by: GroupBy,
}

impl CombinerConfig {
    /// Every column is significant.
    pub fn all_columns() -> Self {
        Self {
            columns: ColumnSelection::All,
            group_by: GroupBy::default(),
        }
    }

    /// Only `columns` are significant.
    pub fn for_columns(columns: ColumnSet) -> Self {
        Self {
            columns: ColumnSelection::Only(columns),
            group_by: GroupBy::default(),
        }
    }

    /// Set the reduction-key granularity.
    pub fn with_group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    /// Build a configuration from a setup option map.
    ///
    /// Fails immediately when no column selection is present, so a bad
    /// setup is reported before the first entry is read.
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, CombineError> {
        let mut columns = None;
        let mut all = false;
        let mut group_by = GroupBy::default();

        for (key, value) in options {
            match CombinerOption::parse(key) {
                Some(CombinerOption::Columns) => columns = Some(ColumnSet::parse(value)?),
                Some(CombinerOption::All) => all = parse_bool(CombinerOption::All, value)?,
                Some(CombinerOption::GroupBy) => {
                    group_by = GroupBy::parse(value).ok_or_else(|| CombineError::InvalidOption {
                        option: CombinerOption::GroupBy.key(),
                        reason: format!("expected 'column' or 'family', got '{value}'"),
                    })?;
                }
                None => debug!(option = %key, "ignoring unrecognized combiner option"),
            }
        }

        let config = match (all, columns) {
            (true, None) => Self::all_columns(),
            (false, Some(set)) => Self::for_columns(set),
            (true, Some(_)) => {
                return Err(CombineError::InvalidOption {
                    option: CombinerOption::All.key(),
                    reason: "cannot be combined with an explicit column list".to_string(),
                })
            }
            (false, None) => return Err(CombineError::MissingOption(CombinerOption::Columns.key())),
        };

        Ok(config.with_group_by(group_by))
    }

    /// Render this configuration back into a setup option map.
    pub fn to_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        match &self.columns {
            ColumnSelection::All => {
                options.insert(CombinerOption::All.key().to_string(), "true".to_string());
            }
            ColumnSelection::Only(set) => {
                options.insert(CombinerOption::Columns.key().to_string(), set.to_string());
            }
        }
        options.insert(
            CombinerOption::GroupBy.key().to_string(),
            self.group_by.as_str().to_string(),
        );
        options
    }

    /// The significant-column selection.
    pub fn columns(&self) -> &ColumnSelection {
        &self.columns
    }

    /// The reduction-key granularity.
    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    /// True when the key's column is part of the significant set.
    pub fn is_significant(&self, key: &Key) -> bool {
        match &self.columns {
            ColumnSelection::All => true,
            ColumnSelection::Only(set) => set.contains(key),
        }
    }
}

fn parse_bool(option: CombinerOption, value: &str) -> Result<bool, CombineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        other => Err(CombineError::InvalidOption {
            option: option.key(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}
