//! Batch coordination over a fixed-size worker pool.
//!
//! A batch never stops on a per-item error. Each failure is reported as it
//! happens and collected into the final [`BatchReport`]. Events travel over
//! a zero-capacity channel, so the coordinator waits for the consumer on
//! every event; the channel closes when the batch is finished.

use std::fmt;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, info_span, warn};

use crate::error::Result;
use crate::identity::Fingerprint;
use crate::pool::WorkerPool;

/// A per-item failure captured by a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub error: String,
}

impl ItemError {
    pub fn new(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            error: error.into(),
        }
    }

    /// The item was never started because the batch was cancelled.
    pub fn cancelled(item: impl Into<String>) -> Self {
        Self::new(item, "cancelled before start")
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.error)
    }
}

/// Anything a batch can run over.
pub trait BatchItem: Send + 'static {
    fn label(&self) -> String;
}

impl BatchItem for PathBuf {
    fn label(&self) -> String {
        self.display().to_string()
    }
}

impl BatchItem for Fingerprint {
    fn label(&self) -> String {
        self.to_string()
    }
}

impl BatchItem for String {
    fn label(&self) -> String {
        self.clone()
    }
}

/// Successful outcome of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Done,
    /// Nothing to do, e.g. the item was already indexed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    /// Emitted after every finished item. `completed` never decreases.
    Progress {
        completed: usize,
        total: usize,
        percent: u8,
    },
    Failed(ItemError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<ItemError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn completed(&self) -> usize {
        self.succeeded + self.skipped + self.failed.len()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} succeeded, {} skipped, {} failed",
            self.total,
            self.succeeded,
            self.skipped,
            self.failed.len()
        )?;
        for failure in &self.failed {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

/// A batch in flight.
#[derive(Debug)]
pub struct BatchRun {
    events: Receiver<BatchEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<BatchReport>,
}

impl BatchRun {
    /// Event stream; iteration ends when the batch is finished.
    pub fn events(&self) -> &Receiver<BatchEvent> {
        &self.events
    }

    /// Stop dispatching new items of this batch. Running items finish
    /// normally; later batches on the same coordinator are unaffected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain remaining events and return the final report.
    pub fn wait(self) -> BatchReport {
        for _ in self.events.iter() {}
        match self.handle.join() {
            Ok(report) => report,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    pool: WorkerPool,
    cancel: CancellationToken,
    span: Span,
}

impl BatchCoordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            pool: WorkerPool::new("batch", workers),
            cancel: CancellationToken::new(),
            span: info_span!("batch"),
        }
    }

    /// Parent token of every batch this coordinator starts. Cancelling it
    /// stops all current and future batches; share it with the tool runners
    /// so running subprocesses are killed too.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start `op` over `items` on a background coordinator thread.
    pub fn run<T, F>(&self, items: Vec<T>, op: F) -> Result<BatchRun>
    where
        T: BatchItem,
        F: Fn(&T) -> Result<ItemStatus> + Send + Sync + 'static,
    {
        let (tx, rx) = bounded(0);
        let pool = self.pool.clone();
        let cancel = self.cancel.child_token();
        let run_cancel = cancel.clone();
        let span = self.span.clone();
        let handle = thread::Builder::new()
            .name("batch-coordinator".to_string())
            .spawn(move || {
                let _entered = span.enter();
                coordinate(&pool, &run_cancel, items, op, tx)
            })?;
        Ok(BatchRun {
            events: rx,
            cancel,
            handle,
        })
    }

    /// Run to completion, discarding events.
    pub fn run_to_completion<T, F>(&self, items: Vec<T>, op: F) -> Result<BatchReport>
    where
        T: BatchItem,
        F: Fn(&T) -> Result<ItemStatus> + Send + Sync + 'static,
    {
        Ok(self.run(items, op)?.wait())
    }
}

struct Aggregator {
    report: BatchReport,
    events: Sender<BatchEvent>,
}

impl Aggregator {
    fn record(&mut self, label: String, result: Result<ItemStatus>) {
        match result {
            Ok(ItemStatus::Done) => self.report.succeeded += 1,
            Ok(ItemStatus::Skipped) => self.report.skipped += 1,
            Err(err) if err.is_already_exists() => self.report.skipped += 1,
            Err(err) => {
                warn!(item = %label, "batch item failed: {err}");
                self.fail(ItemError::new(label, err.to_string()));
                return;
            }
        }
        self.progress();
    }

    fn fail(&mut self, failure: ItemError) {
        self.emit(BatchEvent::Failed(failure.clone()));
        self.report.failed.push(failure);
        self.progress();
    }

    fn progress(&mut self) {
        let completed = self.report.completed();
        let total = self.report.total;
        let percent = if total == 0 {
            100
        } else {
            (completed * 100 / total) as u8
        };
        self.emit(BatchEvent::Progress {
            completed,
            total,
            percent,
        });
    }

    /// A consumer that went away only loses events, never results.
    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }
}

fn coordinate<T, F>(
    pool: &WorkerPool,
    cancel: &CancellationToken,
    items: Vec<T>,
    op: F,
    events: Sender<BatchEvent>,
) -> BatchReport
where
    T: BatchItem,
    F: Fn(&T) -> Result<ItemStatus> + Sync,
{
    let total = items.len();
    info!(total, workers = pool.size(), "batch started");
    let mut aggregator = Aggregator {
        report: BatchReport {
            total,
            ..BatchReport::default()
        },
        events,
    };

    let undispatched = pool.execute(
        items,
        cancel,
        |item| op(item),
        |item, result| aggregator.record(item.label(), result),
    );
    if !undispatched.is_empty() {
        warn!(count = undispatched.len(), "batch cancelled before all items started");
    }
    for item in undispatched {
        aggregator.fail(ItemError::cancelled(item.label()));
    }
    if total == 0 {
        aggregator.progress();
    }

    let report = aggregator.report;
    info!(
        succeeded = report.succeeded,
        skipped = report.skipped,
        failed = report.failed.len(),
        "batch finished"
    );
    report
}
