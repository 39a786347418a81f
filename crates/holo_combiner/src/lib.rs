//! Grouping reduction crate.
//!
//! This crate folds runs of adjacent, same-key entries of a sorted entry
//! stream into one entry per run. The API surface is intentionally small:
//! callers supply a `Reducer` (value codec plus merge function) and a
//! validated `CombinerConfig`, then stream entries through `Combiner`.

pub mod combiner;
