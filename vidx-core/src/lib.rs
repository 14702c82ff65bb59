//! Video library indexing: content identities, duplicate detection, codec
//! metadata and player scrubbing assets (thumbnail, preview clip and
//! storyboard sprite sheets with their cue index).
//!
//! Decoding and encoding are delegated to `ffmpeg`/`ffprobe` through the
//! [`transcode::Transcoder`] trait; persistence goes through
//! [`catalog::Catalog`].

pub mod assets;
pub mod batch;
pub mod catalog;
pub mod cue;
pub mod duplicates;
pub mod error;
mod fsutil;
pub mod identity;
pub mod indexer;
pub mod markers;
pub mod pool;
pub mod probe;
pub mod scanner;
pub mod storyboard;
pub mod transcode;

pub use assets::{AssetKind, AssetLayout, AssetOptions, DerivedAssetGenerator, Generation};
pub use batch::{
    BatchCoordinator, BatchEvent, BatchReport, BatchRun, ItemError, ItemStatus,
};
pub use catalog::{Catalog, CatalogTx, MemoryCatalog, VideoRecord};
pub use duplicates::{DuplicateDetector, DuplicateReport};
pub use error::{Result, VidxError};
pub use identity::{Fingerprint, fingerprint_file};
pub use indexer::{IndexOutcome, Indexer};
pub use markers::{Marker, MarkerStore};
pub use pool::{PoolSizes, WorkerPool};
pub use probe::{CodecRecord, MetadataExtractor, Prober};
pub use scanner::{Group, ScannerOptions, Space, VideoScanner};
pub use storyboard::{
    KeyframeReconciliation, StoryboardGenerator, StoryboardOptions, TileLayout,
};
pub use transcode::{FfmpegTranscoder, PreviewEncoding, ToolRunner, Transcoder};
