use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vidx_core::pool::PoolSizes;
use vidx_core::scanner::{DEFAULT_EXCLUDED_DIRS, DEFAULT_VIDEO_EXTENSIONS, ScannerOptions};
use vidx_core::storyboard::{
    KeyframeReconciliation, MAX_SHEET_EDGE, StoryboardOptions, TileLayout,
};
use vidx_core::transcode::{CellSize, PreviewEncoding};
use vidx_core::{AssetLayout, AssetOptions};

/// Everything needed to run the indexing pipeline. Every section falls back
/// to its defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VidxConfig {
    pub library: LibraryConfig,
    pub assets: AssetsConfig,
    pub storyboard: StoryboardConfig,
    pub tools: ToolsConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directory scanned for videos. Required by anything that scans.
    pub root: Option<PathBuf>,
    /// Extensions recognised as video, case-insensitive, without the dot.
    pub video_extensions: Vec<String>,
    /// Directory names never descended into. Hidden entries are always
    /// skipped regardless of this list.
    pub excluded_dirs: Vec<String>,
    /// Follow symbolic links while walking. Files reachable twice are still
    /// reported once.
    pub follow_links: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: None,
            video_extensions: DEFAULT_VIDEO_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            excluded_dirs: DEFAULT_EXCLUDED_DIRS
                .iter()
                .map(|dir| dir.to_string())
                .collect(),
            follow_links: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Root of the `thumbnails/`, `previews/`, `preview_thumbnails/` and
    /// `video_markers/` trees.
    pub root: PathBuf,
    pub thumbnail_width: u32,
    pub preview_width: u32,
    /// Length of the preview clip, centred on the middle of the video.
    pub preview_seconds: f64,
    /// Preview container; also the preview file extension.
    pub preview_container: String,
    pub preview_codec: String,
    /// Target bitrate. Peaks are capped at 1.5x.
    pub preview_bitrate_kbps: u32,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        let encoding = PreviewEncoding::default();
        let options = AssetOptions::default();
        Self {
            root: PathBuf::from("assets"),
            thumbnail_width: options.thumbnail_width,
            preview_width: options.preview_width,
            preview_seconds: options.preview_seconds,
            preview_container: encoding.container,
            preview_codec: encoding.video_codec,
            preview_bitrate_kbps: encoding.bitrate_kbps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoryboardConfig {
    pub cols: u32,
    pub rows: u32,
    pub cell_width: u32,
    pub cell_height: u32,
    /// Sprite sheet JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Duration of the final cue, which has no following keyframe.
    pub last_cue_seconds: f64,
    /// `strict` fails when decoded keyframes and probed keyframe timestamps
    /// disagree in number; `truncate` pairs what it can.
    pub reconciliation: KeyframeReconciliation,
    /// Prefix for sprite file names inside cue bodies, e.g. a URL path.
    pub sprite_prefix: String,
}

impl Default for StoryboardConfig {
    fn default() -> Self {
        let options = StoryboardOptions::default();
        Self {
            cols: options.layout.cols,
            rows: options.layout.rows,
            cell_width: options.layout.cell.width,
            cell_height: options.layout.cell.height,
            jpeg_quality: options.jpeg_quality,
            last_cue_seconds: options.last_cue_secs,
            reconciliation: options.reconciliation,
            sprite_prefix: options.sprite_prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Kill any single tool invocation running longer than this. Unset means
    /// no limit.
    pub timeout_secs: Option<u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout_secs: None,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Pool sizes. Zero derives the size from the CPU count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub hashing: usize,
    pub metadata: usize,
    pub batch: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("storyboard grid and cell dimensions must be non-zero")]
    EmptyTileLayout,
    #[error("jpeg quality must be within 1..=100, got {0}")]
    JpegQuality(u8),
    #[error("preview length must be positive, got {0}")]
    PreviewLength(f64),
    #[error("{0} width must be non-zero")]
    ZeroWidth(&'static str),
    #[error("at least one video extension is required")]
    NoVideoExtensions,
    #[error("last cue length must be positive, got {0}")]
    LastCueLength(f64),
    #[error(
        "storyboard sheet of {cols}x{rows} cells at {cell_width}x{cell_height} \
         exceeds {max}px per edge",
        max = MAX_SHEET_EDGE
    )]
    SheetTooLarge {
        cols: u32,
        rows: u32,
        cell_width: u32,
        cell_height: u32,
    },
}

impl VidxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let board = &self.storyboard;
        if board.cols == 0
            || board.rows == 0
            || board.cell_width == 0
            || board.cell_height == 0
        {
            return Err(ConfigError::EmptyTileLayout);
        }
        if self.storyboard_options().layout.checked_sheet_size().is_none() {
            return Err(ConfigError::SheetTooLarge {
                cols: board.cols,
                rows: board.rows,
                cell_width: board.cell_width,
                cell_height: board.cell_height,
            });
        }
        if !(1..=100).contains(&board.jpeg_quality) {
            return Err(ConfigError::JpegQuality(board.jpeg_quality));
        }
        if board.last_cue_seconds.is_nan() || board.last_cue_seconds <= 0.0 {
            return Err(ConfigError::LastCueLength(board.last_cue_seconds));
        }
        if self.assets.preview_seconds.is_nan() || self.assets.preview_seconds <= 0.0 {
            return Err(ConfigError::PreviewLength(self.assets.preview_seconds));
        }
        if self.assets.thumbnail_width == 0 {
            return Err(ConfigError::ZeroWidth("thumbnail"));
        }
        if self.assets.preview_width == 0 {
            return Err(ConfigError::ZeroWidth("preview"));
        }
        if self.library.video_extensions.is_empty() {
            return Err(ConfigError::NoVideoExtensions);
        }
        Ok(())
    }

    pub fn scanner_options(&self) -> ScannerOptions {
        ScannerOptions {
            video_extensions: self.library.video_extensions.clone(),
            excluded_dirs: self.library.excluded_dirs.clone(),
            follow_links: self.library.follow_links,
        }
    }

    pub fn asset_layout(&self) -> AssetLayout {
        AssetLayout::new(&self.assets.root, &self.assets.preview_container)
    }

    pub fn asset_options(&self) -> AssetOptions {
        AssetOptions {
            thumbnail_width: self.assets.thumbnail_width,
            preview_width: self.assets.preview_width,
            preview_seconds: self.assets.preview_seconds,
        }
    }

    pub fn preview_encoding(&self) -> PreviewEncoding {
        PreviewEncoding {
            container: self.assets.preview_container.clone(),
            video_codec: self.assets.preview_codec.clone(),
            bitrate_kbps: self.assets.preview_bitrate_kbps,
        }
    }

    pub fn storyboard_options(&self) -> StoryboardOptions {
        let board = &self.storyboard;
        StoryboardOptions {
            layout: TileLayout {
                cols: board.cols,
                rows: board.rows,
                cell: CellSize {
                    width: board.cell_width,
                    height: board.cell_height,
                },
            },
            jpeg_quality: board.jpeg_quality,
            last_cue_secs: board.last_cue_seconds,
            reconciliation: board.reconciliation,
            sprite_prefix: board.sprite_prefix.clone(),
        }
    }

    /// Configured pool sizes, with zeros replaced by the CPU-derived default.
    pub fn pool_sizes(&self) -> PoolSizes {
        let derived = PoolSizes::default();
        let pick = |configured: usize, fallback: usize| {
            if configured == 0 { fallback } else { configured }
        };
        PoolSizes {
            hashing: pick(self.workers.hashing, derived.hashing),
            metadata: pick(self.workers.metadata, derived.metadata),
            batch: pick(self.workers.batch, derived.batch),
        }
    }
}
