use std::collections::BTreeMap;

use super::key::Entry;

/// Phase of the storage engine that is driving the combiner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReducePhase {
    #[default]
    Scan,
    MinorCompaction,
    MajorCompaction,
}

/// Environment handed to combiner setup by the storage engine.
///
/// The progress reducer reads none of it. Reducers sharing the same driver
/// see it through `Reducer::merge_in` when they need table settings, the
/// compaction phase, or auxiliary entry streams.
#[derive(Clone, Debug, Default)]
pub struct ReduceContext {
    phase: ReducePhase,
    full_major_compaction: bool,
    settings: BTreeMap<String, String>,
    side_channels: Vec<Vec<Entry>>,
}

impl ReduceContext {
    /// Context for a read.
    pub fn scan() -> Self {
        Self::default()
    }

    /// Context for flushing freshly written entries.
    pub fn minor_compaction() -> Self {
        Self::default().in_phase(ReducePhase::MinorCompaction, false)
    }

    /// Context for a major compaction; `full` is true when every file of the
    /// tablet takes part in the pass.
    pub fn major_compaction(full: bool) -> Self {
        Self::default().in_phase(ReducePhase::MajorCompaction, full)
    }

    /// Copy of this context, settings included, for another phase.
    pub fn in_phase(&self, phase: ReducePhase, full: bool) -> Self {
        Self {
            phase,
            full_major_compaction: full,
            settings: self.settings.clone(),
            side_channels: self.side_channels.clone(),
        }
    }

    /// Add a table setting visible to reducers.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Look up a table setting.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Rewrite this context was built for.
    pub fn phase(&self) -> ReducePhase {
        self.phase
    }

    /// Informational only: the progress merge never depends on this flag.
    pub fn is_full_major_compaction(&self) -> bool {
        self.phase == ReducePhase::MajorCompaction && self.full_major_compaction
    }

    /// Register an auxiliary sorted entry stream for reducers that read one.
    pub fn register_side_channel(&mut self, entries: Vec<Entry>) {
        self.side_channels.push(entries);
    }

    /// Auxiliary streams in registration order.
    pub fn side_channels(&self) -> &[Vec<Entry>] {
        &self.side_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combiner::Key;

    #[test]
    fn full_flag_only_applies_to_major_compactions() {
        assert!(ReduceContext::major_compaction(true).is_full_major_compaction());
        assert!(!ReduceContext::major_compaction(false).is_full_major_compaction());
        assert!(!ReduceContext::minor_compaction().is_full_major_compaction());
        assert_eq!(ReduceContext::scan().phase(), ReducePhase::Scan);
    }

    #[test]
    fn settings_and_side_channels_are_exposed() {
        let mut ctx = ReduceContext::scan().with_setting("table.name", "replication");
        ctx.register_side_channel(vec![Entry::new(Key::new("r", "f", "q"), &b"v"[..])]);
        assert_eq!(ctx.setting("table.name"), Some("replication"));
        assert_eq!(ctx.setting("missing"), None);
        assert_eq!(ctx.side_channels().len(), 1);
    }

    #[test]
    fn switching_phase_keeps_settings() {
        let ctx = ReduceContext::scan().with_setting("tablet", "replication");
        let major = ctx.in_phase(ReducePhase::MajorCompaction, true);
        assert!(major.is_full_major_compaction());
        assert_eq!(major.setting("tablet"), Some("replication"));
        assert_eq!(ctx.phase(), ReducePhase::Scan);
    }
}
