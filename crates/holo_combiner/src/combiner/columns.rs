//! Significant-column selection.
//!
//! A column list is written as comma-separated `family[:qualifier]` items.
//! Names may contain `,`, `:` or `%` when written as `%XX` hex escapes.

use std::collections::BTreeSet;
use std::fmt;

use super::error::CombineError;
use super::key::Key;

const OPTION_NAME: &str = "columns";

/// One configured column: a whole family, or a single family/qualifier pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column {
    pub family: Vec<u8>,
    pub qualifier: Option<Vec<u8>>,
}

impl Column {
    pub fn family(family: impl Into<Vec<u8>>) -> Self {
        Self {
            family: family.into(),
            qualifier: None,
        }
    }

    pub fn qualified(family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            family: family.into(),
            qualifier: Some(qualifier.into()),
        }
    }

    fn parse(item: &str) -> Result<Self, CombineError> {
        let (family, qualifier) = match item.split_once(':') {
            Some((family, qualifier)) => (family, Some(qualifier)),
            None => (item, None),
        };
        let family = percent_decode(family)?;
        if family.is_empty() {
            return Err(invalid(format!("empty column family in '{item}'")));
        }
        let qualifier = qualifier.map(percent_decode).transpose()?;
        Ok(Self { family, qualifier })
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&percent_encode(&self.family))?;
        if let Some(qualifier) = &self.qualifier {
            write!(f, ":{}", percent_encode(qualifier))?;
        }
        Ok(())
    }
}

/// Set of significant columns. Membership is checked per entry key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnSet {
    families: BTreeSet<Vec<u8>>,
    columns: BTreeSet<(Vec<u8>, Vec<u8>)>,
}

impl ColumnSet {
    pub fn new(columns: impl IntoIterator<Item = Column>) -> Self {
        let mut set = Self::default();
        for column in columns {
            set.insert(column);
        }
        set
    }

    /// Parse a comma-separated `family[:qualifier]` list.
    pub fn parse(list: &str) -> Result<Self, CombineError> {
        let mut set = Self::default();
        for item in list.split(',').map(str::trim) {
            if item.is_empty() {
                continue;
            }
            set.insert(Column::parse(item)?);
        }
        if set.is_empty() {
            return Err(invalid("column list selects no columns"));
        }
        Ok(set)
    }

    pub fn insert(&mut self, column: Column) {
        match column.qualifier {
            None => {
                self.families.insert(column.family);
            }
            Some(qualifier) => {
                self.columns.insert((column.family, qualifier));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty() && self.columns.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        if self.families.contains(&key.family) {
            return true;
        }
        // Avoid building a tuple key when no qualified columns are configured.
        !self.columns.is_empty()
            && self
                .columns
                .contains(&(key.family.clone(), key.qualifier.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = Column> + '_ {
        self.families
            .iter()
            .map(|family| Column::family(family.clone()))
            .chain(
                self.columns
                    .iter()
                    .map(|(family, qualifier)| Column::qualified(family.clone(), qualifier.clone())),
            )
    }
}

impl fmt::Display for ColumnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for column in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{column}")?;
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> CombineError {
    CombineError::InvalidOption {
        option: OPTION_NAME,
        reason: reason.into(),
    }
}

fn percent_decode(text: &str) -> Result<Vec<u8>, CombineError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0usize;
    while idx < bytes.len() {
        if bytes[idx] != b'%' {
            out.push(bytes[idx]);
            idx += 1;
            continue;
        }
        let hex = bytes
            .get(idx + 1..idx + 3)
            .and_then(|pair| std::str::from_utf8(pair).ok())
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| invalid(format!("bad escape sequence in '{text}'")))?;
        out.push(hex);
        idx += 3;
    }
    Ok(out)
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b',' | b':' | b'%' => out.push_str(&format!("%{b:02X}")),
            b if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
