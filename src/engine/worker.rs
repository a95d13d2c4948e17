use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::CacheStore;
use crate::error::{TaskExecutionError, Warning};
use crate::progress::ProgressDelta;
use crate::task::{Step, Task, TaskContext, TaskId};

/// Messages from workers to the thread driving the run.
pub(crate) enum Event {
    Progress(TaskId, ProgressDelta),
    Done(Box<Completion>),
}

/// How a dispatched task ended.
pub(crate) struct Completion {
    pub id: TaskId,
    pub outcome: Result<u64, TaskExecutionError>,
    pub warnings: Vec<Warning>,
    pub start: Instant,
    pub duration: Duration,
}

/// Runs one task to completion on the current thread: opens its cache
/// partition, builds its producer and pulls records until it is done.
///
/// Never panics. Errors and panics from the body are returned in the
/// completion, with everything produced so far left in the cache unfinalized.
pub(crate) fn drive(
    task: &Task,
    ctx: TaskContext,
    store: &CacheStore,
    events: &Sender<Event>,
) -> Completion {
    let id = task.id().clone();

    let span = tracing::span!(Level::INFO, "task", name = %id);
    span.pb_set_style(&super::style_task());
    span.pb_set_message(&format!("Running {id}"));
    let _enter = span.enter();

    let start = Instant::now();

    // the cache handle is flushed by its destructor while unwinding
    let outcome = match catch_unwind(AssertUnwindSafe(|| pull(task, &ctx, store, events, &span))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(TaskExecutionError::Panic(message))
        }
    };

    let duration = start.elapsed();

    match &outcome {
        Ok(records) => tracing::debug!(task = %id, records, ?duration, "task finished"),
        Err(err) => tracing::error!(task = %id, "task failed: {err}"),
    }

    Completion {
        id,
        outcome,
        warnings: ctx.into_warnings(),
        start,
        duration,
    }
}

fn pull(
    task: &Task,
    ctx: &TaskContext,
    store: &CacheStore,
    events: &Sender<Event>,
    span: &tracing::Span,
) -> Result<u64, TaskExecutionError> {
    let id = task.id();
    let mut handle = store.open(id)?;
    let mut producer = (task.body)(ctx).map_err(TaskExecutionError::Body)?;

    let total = producer.total();
    if let Some(total) = total {
        span.pb_set_style(&super::style_bar());
        span.pb_set_length(total);
    }

    // The receiver outlives every worker of a layer, a failed send only
    // means the run is being torn down.
    let _ = events.send(Event::Progress(id.clone(), ProgressDelta::Started { total }));

    let mut records = 0;
    loop {
        match producer.next().map_err(TaskExecutionError::Body)? {
            Step::Record(record) => {
                handle.append(&record)?;
                records += 1;
                span.pb_inc(1);
                let _ = events.send(Event::Progress(id.clone(), ProgressDelta::Advanced(1)));
            }
            Step::Once(fields) => handle.set_once(fields)?,
            Step::Done => break,
        }
    }

    handle.finalize()?;
    Ok(records)
}
