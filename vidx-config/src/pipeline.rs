//! Builds the core components from a [`VidxConfig`] and shares one
//! cancellation token between the batch pools and every tool subprocess.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::info;
use vidx_core::{
    BatchCoordinator, Catalog, DerivedAssetGenerator, DuplicateDetector, DuplicateReport,
    FfmpegTranscoder, Indexer, MarkerStore, MetadataExtractor, Space, StoryboardGenerator,
    ToolRunner, Transcoder, VideoScanner,
};

use crate::models::VidxConfig;

pub struct Pipeline {
    config: VidxConfig,
    cancel: CancellationToken,
    scanner: VideoScanner,
    duplicates: DuplicateDetector,
    coordinator: BatchCoordinator,
    indexer: Arc<Indexer>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("scanner", &self.scanner)
            .field("coordinator", &self.coordinator)
            .field("indexer", &self.indexer)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Wire the ffmpeg-backed components over `catalog`.
    pub fn from_config(
        config: VidxConfig,
        catalog: Arc<dyn Catalog>,
    ) -> anyhow::Result<Self> {
        config.validate().context("refusing to build pipeline")?;
        let cancel = CancellationToken::new();
        let runner = |program: &Path| {
            ToolRunner::new(program)
                .with_timeout(config.tools.timeout())
                .with_cancellation(cancel.clone())
        };
        let transcoder: Arc<dyn Transcoder> = Arc::new(FfmpegTranscoder::new(
            runner(config.tools.ffmpeg.as_path()),
            runner(config.tools.ffprobe.as_path()),
            config.preview_encoding(),
        ));
        let extractor = MetadataExtractor::with_ffprobe(
            runner(config.tools.ffprobe.as_path()),
            config.pool_sizes().metadata,
        );
        Ok(Self::assemble(config, cancel, catalog, transcoder, extractor))
    }

    /// Wire the pipeline around caller-supplied media backends.
    pub fn with_backends(
        config: VidxConfig,
        catalog: Arc<dyn Catalog>,
        transcoder: Arc<dyn Transcoder>,
        extractor: MetadataExtractor,
    ) -> anyhow::Result<Self> {
        config.validate().context("refusing to build pipeline")?;
        Ok(Self::assemble(
            config,
            CancellationToken::new(),
            catalog,
            transcoder,
            extractor,
        ))
    }

    fn assemble(
        config: VidxConfig,
        cancel: CancellationToken,
        catalog: Arc<dyn Catalog>,
        transcoder: Arc<dyn Transcoder>,
        extractor: MetadataExtractor,
    ) -> Self {
        let sizes = config.pool_sizes();
        let layout = config.asset_layout();
        let generator = DerivedAssetGenerator::new(
            layout.clone(),
            config.asset_options(),
            Arc::clone(&transcoder),
            StoryboardGenerator::new(transcoder, config.storyboard_options()),
        );
        let indexer = Indexer::new(
            catalog,
            Arc::new(extractor),
            Arc::new(generator),
            Arc::new(MarkerStore::new(layout)),
        );
        info!(
            assets = %config.assets.root.display(),
            hashing = sizes.hashing,
            metadata = sizes.metadata,
            batch = sizes.batch,
            "pipeline ready"
        );
        Self {
            scanner: VideoScanner::new(config.scanner_options()),
            duplicates: DuplicateDetector::new(sizes.hashing),
            coordinator: BatchCoordinator::new(sizes.batch)
                .with_cancellation(cancel.clone()),
            indexer: Arc::new(indexer),
            cancel,
            config,
        }
    }

    pub fn config(&self) -> &VidxConfig {
        &self.config
    }

    pub fn scanner(&self) -> &VideoScanner {
        &self.scanner
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    /// Cancels running batches and kills running tool invocations. This is
    /// a shutdown: every later batch and tool call fails as cancelled. To
    /// stop a single batch use [`vidx_core::BatchRun::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn library_root(&self) -> anyhow::Result<&Path> {
        self.config
            .library
            .root
            .as_deref()
            .ok_or_else(|| anyhow!("library.root is not configured"))
    }

    /// Every video file under the configured library root.
    pub fn library_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let root = self.library_root()?;
        let files = self
            .scanner
            .files(root)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        Ok(files.collect())
    }

    pub fn scan_tree(&self) -> anyhow::Result<Vec<Space>> {
        let root = self.library_root()?;
        self.scanner
            .scan_tree(root)
            .with_context(|| format!("failed to scan {}", root.display()))
    }

    pub fn find_duplicates(&self) -> anyhow::Result<DuplicateReport> {
        let files = self.library_files()?;
        Ok(self.duplicates.detect_with_cancel(files, &self.cancel))
    }
}
