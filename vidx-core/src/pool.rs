//! Fixed-size OS-thread worker pools.
//!
//! Jobs and results travel over zero-capacity channels: the feeder blocks
//! until a worker takes a job, and a worker blocks until the aggregator reads
//! its result. The aggregator is the calling thread, so results are observed
//! one at a time in completion order.

use std::thread;

use crossbeam_channel::{SendError, bounded};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Worker counts for the three pool kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    /// Duplicate-detection hashing (2x CPU, minimum 4).
    pub hashing: usize,
    /// Per-file metadata fan-out (1x CPU).
    pub metadata: usize,
    /// Batch index/cook coordination (1x CPU).
    pub batch: usize,
}

impl PoolSizes {
    pub fn for_cpus(cpus: usize) -> Self {
        let cpus = cpus.max(1);
        Self {
            hashing: (cpus * 2).max(4),
            metadata: cpus,
            batch: cpus,
        }
    }
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self::for_cpus(num_cpus::get())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: String,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` over every item and hand each `(item, result)` pair to
    /// `sink` on the calling thread.
    ///
    /// Once `cancel` fires no further items are dispatched; the items that
    /// never reached a worker are returned in their original order.
    pub fn execute<I, T, R, F, S>(
        &self,
        items: I,
        cancel: &CancellationToken,
        work: F,
        mut sink: S,
    ) -> Vec<T>
    where
        I: IntoIterator<Item = T> + Send,
        T: Send,
        R: Send,
        F: Fn(&T) -> R + Sync,
        S: FnMut(T, R),
    {
        thread::scope(|scope| {
            let (job_tx, job_rx) = bounded::<T>(0);
            let (result_tx, result_rx) = bounded::<(T, R)>(0);

            let feeder = scope.spawn(move || {
                let mut undispatched = Vec::new();
                let mut iter = items.into_iter();
                while let Some(item) = iter.next() {
                    if cancel.is_cancelled() {
                        undispatched.push(item);
                        undispatched.extend(iter);
                        break;
                    }
                    if let Err(SendError(item)) = job_tx.send(item) {
                        undispatched.push(item);
                        undispatched.extend(iter);
                        break;
                    }
                }
                undispatched
            });

            let work = &work;
            for index in 0..self.size {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{index}", self.name))
                    .spawn_scoped(scope, move || {
                        for item in job_rx.iter() {
                            let result = work(&item);
                            if result_tx.send((item, result)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(err) = spawned {
                    error!(pool = %self.name, index, "failed to spawn worker: {err}");
                }
            }
            drop(job_rx);
            drop(result_tx);

            for (item, result) in result_rx.iter() {
                sink(item, result);
            }

            let undispatched = feeder.join().unwrap_or_else(|_| {
                error!(pool = %self.name, "job feeder panicked");
                Vec::new()
            });
            debug!(
                pool = %self.name,
                undispatched = undispatched.len(),
                "pool drained"
            );
            undispatched
        })
    }
}
