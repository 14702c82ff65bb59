use std::collections::HashMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::ItemError;
use crate::identity::{Fingerprint, fingerprint_file};
use crate::pool::WorkerPool;

/// Fingerprints shared by more than one file. Path order inside a group is
/// unspecified.
#[derive(Debug, Default)]
pub struct DuplicateReport {
    pub groups: HashMap<Fingerprint, Vec<PathBuf>>,
    pub hashed: usize,
    pub errors: Vec<ItemError>,
}

impl DuplicateReport {
    pub fn duplicate_files(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    pool: WorkerPool,
}

impl DuplicateDetector {
    pub fn new(workers: usize) -> Self {
        Self {
            pool: WorkerPool::new("dup-hash", workers),
        }
    }

    pub fn detect(&self, paths: Vec<PathBuf>) -> DuplicateReport {
        self.detect_with_cancel(paths, &CancellationToken::new())
    }

    /// Hash every path and group them by identity. Files that fail to hash
    /// are reported and left out of grouping.
    pub fn detect_with_cancel(
        &self,
        paths: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> DuplicateReport {
        let total = paths.len();
        info!(files = total, workers = self.pool.size(), "detecting duplicates");

        let mut by_fingerprint: HashMap<Fingerprint, Vec<PathBuf>> =
            HashMap::new();
        let mut report = DuplicateReport::default();

        let undispatched = self.pool.execute(
            paths,
            cancel,
            |path| fingerprint_file(path),
            |path, result| match result {
                Ok(fingerprint) => {
                    report.hashed += 1;
                    by_fingerprint.entry(fingerprint).or_default().push(path);
                }
                Err(err) => {
                    warn!(path = %path.display(), "failed to hash file: {err}");
                    report.errors.push(ItemError::new(
                        path.display().to_string(),
                        err.to_string(),
                    ));
                }
            },
        );
        for path in undispatched {
            report.errors.push(ItemError::cancelled(path.display().to_string()));
        }

        by_fingerprint.retain(|_, group| group.len() > 1);
        report.groups = by_fingerprint;

        info!(
            hashed = report.hashed,
            groups = report.groups.len(),
            errors = report.errors.len(),
            "duplicate detection finished"
        );
        report
    }
}
