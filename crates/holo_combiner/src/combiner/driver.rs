//! Grouping reduction driver.
//!
//! `Combiner` walks a sorted entry stream and folds every maximal run of
//! adjacent entries that share a reduction key into one entry. The value
//! semantics live in a `Reducer` supplied at construction; the driver only
//! knows how to find run boundaries and when to skip the reducer entirely.
//!
//! Invariants:
//! - A run of one entry is emitted as-is: no decode, no merge, no encode.
//! - Entries outside the significant columns and delete markers are emitted
//!   unmodified in their original position and end any run in progress.
//! - A run either yields exactly one entry or an error; after an error the
//!   iterator yields nothing more.
//! - The accumulator lives only for the duration of one run.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::config::CombinerConfig;
use super::context::ReduceContext;
use super::error::CombineError;
use super::key::{Entry, Key};

/// Value codec plus merge function for one kind of stored value.
///
/// `merge` must be commutative, associative and idempotent: the storage
/// engine may fold any subset of a key's values, in any order, any number
/// of times, and expects the same eventual result.
pub trait Reducer {
    type Value;

    fn decode(&self, raw: &[u8]) -> Result<Self::Value, CombineError>;
    fn encode(&self, value: &Self::Value) -> Vec<u8>;
    fn merge(&self, acc: Self::Value, next: Self::Value) -> Self::Value;

    /// Merge with the invocation's context in view. Defaults to `merge`.
    fn merge_in(&self, ctx: &ReduceContext, acc: Self::Value, next: Self::Value) -> Self::Value {
        let _ = ctx;
        self.merge(acc, next)
    }
}

impl<R: Reducer + ?Sized> Reducer for &R {
    type Value = R::Value;

    fn decode(&self, raw: &[u8]) -> Result<Self::Value, CombineError> {
        (**self).decode(raw)
    }

    fn encode(&self, value: &Self::Value) -> Vec<u8> {
        (**self).encode(value)
    }

    fn merge(&self, acc: Self::Value, next: Self::Value) -> Self::Value {
        (**self).merge(acc, next)
    }

    fn merge_in(&self, ctx: &ReduceContext, acc: Self::Value, next: Self::Value) -> Self::Value {
        (**self).merge_in(ctx, acc, next)
    }
}

/// A reducer bound to its column selection and setup context.
#[derive(Clone, Debug)]
pub struct Combiner<R> {
    config: CombinerConfig,
    reducer: R,
    context: ReduceContext,
}

impl<R: Reducer> Combiner<R> {
    /// Bind `reducer` to `config` with a default scan context.
    pub fn new(config: CombinerConfig, reducer: R) -> Self {
        Self {
            config,
            reducer,
            context: ReduceContext::scan(),
        }
    }

    /// Validate setup options and bind them, and `ctx`, to `reducer`.
    pub fn init(
        reducer: R,
        options: &BTreeMap<String, String>,
        ctx: &ReduceContext,
    ) -> Result<Self, CombineError> {
        let config = CombinerConfig::from_options(options)?;
        Ok(Self::new(config, reducer).with_context(ctx.clone()))
    }

    /// Replace the context used by `combine` and `reduce_run`.
    pub fn with_context(mut self, context: ReduceContext) -> Self {
        self.context = context;
        self
    }

    /// Column selection and grouping.
    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// The bound reducer.
    pub fn reducer(&self) -> &R {
        &self.reducer
    }

    /// Context bound at setup.
    pub fn context(&self) -> &ReduceContext {
        &self.context
    }

    /// Lazily combine a sorted entry stream under the setup context.
    pub fn combine<I>(&self, input: I) -> Combined<'_, R, I::IntoIter>
    where
        I: IntoIterator<Item = Entry>,
    {
        self.combine_in(&self.context, input)
    }

    /// Lazily combine a sorted entry stream under `ctx`.
    pub fn combine_in<'a, I>(&'a self, ctx: &'a ReduceContext, input: I) -> Combined<'a, R, I::IntoIter>
    where
        I: IntoIterator<Item = Entry>,
    {
        Combined {
            combiner: self,
            ctx,
            input: input.into_iter(),
            pending: None,
            last_key: None,
            failed: false,
        }
    }

    /// Combine a sorted entry stream into a vector, failing on the first error.
    pub fn combine_all<I>(&self, input: I) -> Result<Vec<Entry>, CombineError>
    where
        I: IntoIterator<Item = Entry>,
    {
        self.combine(input).collect()
    }

    /// `combine_all` under `ctx`.
    pub fn combine_all_in<I>(&self, ctx: &ReduceContext, input: I) -> Result<Vec<Entry>, CombineError>
    where
        I: IntoIterator<Item = Entry>,
    {
        self.combine_in(ctx, input).collect()
    }

    /// Fold one run of mergeable entries into a single entry.
    ///
    /// A single entry is returned untouched. Longer runs are decoded in
    /// order, folded from the first value, re-encoded, and emitted under the
    /// run's first (newest) key.
    pub fn reduce_run(&self, run: Vec<Entry>) -> Result<Entry, CombineError> {
        self.reduce_run_in(&self.context, run)
    }

    fn reduce_run_in(&self, ctx: &ReduceContext, run: Vec<Entry>) -> Result<Entry, CombineError> {
        let mut entries = run.into_iter();
        let Some(first) = entries.next() else {
            return Err(CombineError::EmptyRun);
        };
        let mut rest = entries.peekable();
        if rest.peek().is_none() {
            return Ok(first);
        }

        let mut acc = self.reducer.decode(&first.value)?;
        for entry in rest {
            let next = self.reducer.decode(&entry.value)?;
            acc = self.reducer.merge_in(ctx, acc, next);
        }
        Ok(Entry {
            key: first.key,
            value: Bytes::from(self.reducer.encode(&acc)),
        })
    }

    /// Fold already-decoded values. A single value is returned as-is.
    pub fn reduce_values<I>(&self, values: I) -> Result<R::Value, CombineError>
    where
        I: IntoIterator<Item = R::Value>,
    {
        let mut values = values.into_iter();
        let first = values.next().ok_or(CombineError::EmptyRun)?;
        Ok(values.fold(first, |acc, next| {
            self.reducer.merge_in(&self.context, acc, next)
        }))
    }

    /// Reduction key of `key`, or `None` when it is emitted without grouping.
    fn group_key(&self, key: &Key) -> Option<Key> {
        if key.deleted || !self.config.is_significant(key) {
            return None;
        }
        Some(key.reduction_key(self.config.group_by()))
    }
}

/// Iterator returned by `Combiner::combine`.
pub struct Combined<'a, R, I> {
    combiner: &'a Combiner<R>,
    ctx: &'a ReduceContext,
    input: I,
    pending: Option<Entry>,
    last_key: Option<Key>,
    failed: bool,
}

impl<R, I> Combined<'_, R, I>
where
    R: Reducer,
    I: Iterator<Item = Entry>,
{
    /// Next input entry, checking that keys never decrease.
    fn pull(&mut self) -> Result<Option<Entry>, CombineError> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }
        let Some(entry) = self.input.next() else {
            return Ok(None);
        };
        if let Some(previous) = self.last_key.as_ref() {
            if entry.key < *previous {
                return Err(CombineError::UnsortedInput {
                    previous: Box::new(previous.clone()),
                    next: Box::new(entry.key),
                });
            }
        }
        self.last_key = Some(entry.key.clone());
        Ok(Some(entry))
    }

    fn advance(&mut self) -> Result<Option<Entry>, CombineError> {
        let Some(first) = self.pull()? else {
            return Ok(None);
        };
        let Some(run_key) = self.combiner.group_key(&first.key) else {
            return Ok(Some(first));
        };

        let mut run = vec![first];
        while let Some(next) = self.pull()? {
            if self.combiner.group_key(&next.key).as_ref() == Some(&run_key) {
                run.push(next);
            } else {
                self.pending = Some(next);
                break;
            }
        }
        self.combiner.reduce_run_in(self.ctx, run).map(Some)
    }
}

impl<R, I> Iterator for Combined<'_, R, I>
where
    R: Reducer,
    I: Iterator<Item = Entry>,
{
    type Item = Result<Entry, CombineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
