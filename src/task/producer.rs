//! Task bodies are pull-based producers.
//!
//! The executor drives a [`Producer`] by calling [`Producer::next`] until it
//! returns [`Step::Done`] or an error. Every [`Step::Record`] is appended to
//! the task's cache as soon as it is pulled, so progress survives a failure
//! or an interruption up to the last flush.

use crate::core::Record;

/// One pull from a task body.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// An incremental result, appended to the record sequence.
    Record(Record),
    /// Fields stored once per instance (e.g. a final aggregate). Later
    /// one-shot fields overwrite earlier ones with the same key.
    Once(Record),
    /// The body has finished.
    Done,
}

/// An interruptible producer of incremental records.
pub trait Producer: Send {
    /// Produces the next step. Returning an error fails the task, records
    /// pulled so far are kept in the (unfinalized) cache.
    fn next(&mut self) -> anyhow::Result<Step>;

    /// Expected number of records, if known up front.
    fn total(&self) -> Option<u64> {
        None
    }
}

impl Producer for Box<dyn Producer> {
    fn next(&mut self) -> anyhow::Result<Step> {
        (**self).next()
    }

    fn total(&self) -> Option<u64> {
        (**self).total()
    }
}

/// A producer backed by a closure.
pub struct FromFn<F> {
    func: F,
    total: Option<u64>,
}

impl<F> FromFn<F> {
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

impl<F> Producer for FromFn<F>
where
    F: FnMut() -> anyhow::Result<Step> + Send,
{
    fn next(&mut self) -> anyhow::Result<Step> {
        (self.func)()
    }

    fn total(&self) -> Option<u64> {
        self.total
    }
}

/// Creates a producer from a closure called once per pull.
pub fn from_fn<F>(func: F) -> FromFn<F>
where
    F: FnMut() -> anyhow::Result<Step> + Send,
{
    FromFn { func, total: None }
}

/// A producer yielding the items of an iterator as records.
pub struct Records<I> {
    iter: I,
    total: Option<u64>,
}

impl<I> Producer for Records<I>
where
    I: Iterator<Item = anyhow::Result<Record>> + Send,
{
    fn next(&mut self) -> anyhow::Result<Step> {
        match self.iter.next() {
            Some(record) => Ok(Step::Record(record?)),
            None => Ok(Step::Done),
        }
    }

    fn total(&self) -> Option<u64> {
        self.total
    }
}

/// Creates a producer from fallible records. The total is taken from the
/// iterator's size hint when it is exact.
pub fn records<I>(iter: I) -> Records<I::IntoIter>
where
    I: IntoIterator<Item = anyhow::Result<Record>>,
{
    let iter = iter.into_iter();
    let total = match iter.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower as u64),
        _ => None,
    };

    Records { iter, total }
}

/// A producer that yields nothing. Useful for tasks run for side effects.
pub fn empty() -> Records<std::iter::Empty<anyhow::Result<Record>>> {
    records(std::iter::empty())
}
