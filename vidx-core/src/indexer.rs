//! Single-file indexing and the batch entry points built on it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{Span, debug, info, info_span};

use crate::assets::{AssetReport, DerivedAssetGenerator};
use crate::batch::{BatchCoordinator, BatchRun, ItemStatus};
use crate::catalog::{Catalog, VideoRecord, transaction};
use crate::error::Result;
use crate::identity::{Fingerprint, fingerprint_file};
use crate::markers::{Marker, MarkerStore};
use crate::probe::MetadataExtractor;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Indexed(VideoRecord),
    /// The identity was already in the catalog; nothing was changed.
    AlreadyIndexed(Fingerprint),
}

impl IndexOutcome {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            IndexOutcome::Indexed(record) => &record.fingerprint,
            IndexOutcome::AlreadyIndexed(fingerprint) => fingerprint,
        }
    }
}

pub struct Indexer {
    catalog: Arc<dyn Catalog>,
    extractor: Arc<MetadataExtractor>,
    assets: Arc<DerivedAssetGenerator>,
    markers: Arc<MarkerStore>,
    span: Span,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("extractor", &self.extractor)
            .field("assets", &self.assets)
            .field("markers", &self.markers)
            .finish_non_exhaustive()
    }
}

impl Indexer {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        extractor: Arc<MetadataExtractor>,
        assets: Arc<DerivedAssetGenerator>,
        markers: Arc<MarkerStore>,
    ) -> Self {
        Self {
            catalog,
            extractor,
            assets,
            markers,
            span: info_span!("indexer"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Record `path` under its identity together with its codec record.
    pub fn index(&self, path: &Path) -> Result<IndexOutcome> {
        let _entered = self.span.enter();
        let fingerprint = fingerprint_file(path)?;
        match self.catalog.get_video(&fingerprint) {
            Ok(_) => {
                debug!(path = %path.display(), %fingerprint, "already indexed");
                return Ok(IndexOutcome::AlreadyIndexed(fingerprint));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let size = fs::metadata(path)?.len();
        let codec = self.extractor.extract(path)?;
        let record = VideoRecord::new(fingerprint.clone(), path, size, codec);

        let inserted = transaction(self.catalog.as_ref(), |tx| {
            tx.insert_video(record.clone())?;
            tx.insert_path(&fingerprint, path)
        });
        match inserted {
            Ok(()) => {
                info!(path = %path.display(), %fingerprint, "indexed");
                Ok(IndexOutcome::Indexed(record))
            }
            // Another worker indexed a copy of the same content first.
            Err(err) if err.is_already_exists() => {
                Ok(IndexOutcome::AlreadyIndexed(fingerprint))
            }
            Err(err) => Err(err),
        }
    }

    /// Generate the missing derived assets of an indexed identity.
    pub fn cook(&self, fingerprint: &Fingerprint) -> Result<AssetReport> {
        let _entered = self.span.enter();
        let record = self.catalog.get_video(fingerprint)?;
        let source = self.catalog.get_path(fingerprint)?;
        self.assets.ensure_all(fingerprint, &source, &record.codec)
    }

    /// Remove derived assets, markers and catalog entries of an identity.
    pub fn unindex(&self, fingerprint: &Fingerprint) -> Result<VideoRecord> {
        let _entered = self.span.enter();
        let record = self.catalog.get_video(fingerprint)?;
        self.assets.remove_all(fingerprint)?;
        self.markers.delete_all(fingerprint)?;
        let removed = self.catalog.remove_video(fingerprint)?;
        info!(%fingerprint, path = %record.path.display(), "unindexed");
        Ok(removed)
    }

    pub fn markers(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>> {
        self.markers.list(fingerprint)
    }

    /// Add a marker to an indexed video; cue lengths follow its duration.
    /// The catalog copy is replaced before the marker lock is released.
    pub fn add_marker(
        &self,
        fingerprint: &Fingerprint,
        marker: Marker,
    ) -> Result<Vec<Marker>> {
        let record = self.catalog.get_video(fingerprint)?;
        self.markers.add_then(
            fingerprint,
            marker,
            record.codec.duration_sec,
            |saved| self.catalog.replace_markers(fingerprint, saved.to_vec()),
        )
    }

    pub fn delete_marker(
        &self,
        fingerprint: &Fingerprint,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Result<Vec<Marker>> {
        let record = self.catalog.get_video(fingerprint)?;
        self.markers.delete_one_then(
            fingerprint,
            (hour, minute, second),
            record.codec.duration_sec,
            |saved| self.catalog.replace_markers(fingerprint, saved.to_vec()),
        )
    }

    pub fn clear_markers(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.markers.delete_all_then(fingerprint, || {
            self.catalog.replace_markers(fingerprint, Vec::new())
        })
    }

    /// Index every path on the batch pool.
    pub fn index_all(
        self: &Arc<Self>,
        coordinator: &BatchCoordinator,
        paths: Vec<PathBuf>,
    ) -> Result<BatchRun> {
        let indexer = Arc::clone(self);
        coordinator.run(paths, move |path: &PathBuf| {
            indexer.index(path).map(|outcome| ItemStatus::from(&outcome))
        })
    }

    /// Cook every identity on the batch pool.
    pub fn cook_all(
        self: &Arc<Self>,
        coordinator: &BatchCoordinator,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<BatchRun> {
        let indexer = Arc::clone(self);
        coordinator.run(fingerprints, move |fingerprint: &Fingerprint| {
            let report = indexer.cook(fingerprint)?;
            Ok(if report.all_existed() {
                ItemStatus::Skipped
            } else {
                ItemStatus::Done
            })
        })
    }

    /// Every identity currently in the catalog.
    pub fn indexed(&self) -> Result<Vec<Fingerprint>> {
        Ok(self
            .catalog
            .list_videos()?
            .into_iter()
            .map(|record| record.fingerprint)
            .collect())
    }
}

impl From<&IndexOutcome> for ItemStatus {
    fn from(outcome: &IndexOutcome) -> Self {
        match outcome {
            IndexOutcome::Indexed(_) => ItemStatus::Done,
            IndexOutcome::AlreadyIndexed(_) => ItemStatus::Skipped,
        }
    }
}
