//! Storyboard generation: keyframe sprite sheets plus a cue index.
//!
//! Keyframe images and keyframe timestamps come from two separate tool
//! invocations. They are paired by position, so their counts are compared
//! before any cue is written (see [`KeyframeReconciliation`]).
//!
//! The cue file is written last. Its presence means the sprite sheets it
//! references are complete.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assets::{AssetLayout, Generation};
use crate::cue::{self, Cue, CueTime};
use crate::error::{Result, VidxError};
use crate::fsutil::{ScratchDir, write_atomic, write_via_temp};
use crate::identity::Fingerprint;
use crate::transcode::{CellSize, Transcoder};

/// Name of the sprite sheet for a zero-based page index.
pub fn sprite_sheet_name(page: usize) -> String {
    format!("thumb_L0_{:03}.jpg", page + 1)
}

/// Largest sprite sheet edge, in pixels, a JPEG can encode.
pub const MAX_SHEET_EDGE: u32 = 65_535;

/// Grid of cells on one sprite sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayout {
    pub cols: u32,
    pub rows: u32,
    pub cell: CellSize,
}

impl Default for TileLayout {
    fn default() -> Self {
        Self {
            cols: 5,
            rows: 5,
            cell: CellSize::default(),
        }
    }
}

/// Where keyframe `index` lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePosition {
    pub page: usize,
    pub x: u32,
    pub y: u32,
}

impl TileLayout {
    pub fn per_page(&self) -> usize {
        (self.cols as usize) * (self.rows as usize)
    }

    pub fn sheet_width(&self) -> u32 {
        self.cols.saturating_mul(self.cell.width)
    }

    pub fn sheet_height(&self) -> u32 {
        self.rows.saturating_mul(self.cell.height)
    }

    /// Sheet dimensions, or `None` when the grid is empty or a sheet edge
    /// would exceed [`MAX_SHEET_EDGE`].
    pub fn checked_sheet_size(&self) -> Option<(u32, u32)> {
        let width = self.cols.checked_mul(self.cell.width)?;
        let height = self.rows.checked_mul(self.cell.height)?;
        let fits = |edge: u32| (1..=MAX_SHEET_EDGE).contains(&edge);
        (fits(width) && fits(height)).then_some((width, height))
    }

    pub fn validate(&self) -> Result<()> {
        if self.checked_sheet_size().is_none() {
            return Err(VidxError::Validation(format!(
                "tile layout {}x{} of {}x{} cells does not fit a sprite sheet \
                 of at most {MAX_SHEET_EDGE}px per edge",
                self.cols, self.rows, self.cell.width, self.cell.height
            )));
        }
        Ok(())
    }

    pub fn position(&self, index: usize) -> TilePosition {
        let per_page = self.per_page().max(1);
        let cols = (self.cols as usize).max(1);
        let slot = index % per_page;
        TilePosition {
            page: index / per_page,
            x: (slot % cols) as u32 * self.cell.width,
            y: (slot / cols) as u32 * self.cell.height,
        }
    }
}

/// What to do when the number of decoded keyframe images differs from the
/// number of probed keyframe timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyframeReconciliation {
    /// Fail with [`VidxError::KeyframeMismatch`].
    #[default]
    Strict,
    /// Pair the common prefix and drop the surplus.
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardOptions {
    pub layout: TileLayout,
    pub jpeg_quality: u8,
    /// Length of the final cue, which has no following keyframe.
    pub last_cue_secs: f64,
    pub reconciliation: KeyframeReconciliation,
    /// Prepended to sprite file names in cue bodies. Empty means relative to
    /// the cue file.
    pub sprite_prefix: String,
}

impl Default for StoryboardOptions {
    fn default() -> Self {
        Self {
            layout: TileLayout::default(),
            jpeg_quality: 75,
            last_cue_secs: 10.0,
            reconciliation: KeyframeReconciliation::Strict,
            sprite_prefix: String::new(),
        }
    }
}

pub struct StoryboardGenerator {
    transcoder: Arc<dyn Transcoder>,
    options: StoryboardOptions,
}

impl std::fmt::Debug for StoryboardGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryboardGenerator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StoryboardGenerator {
    pub fn new(transcoder: Arc<dyn Transcoder>, options: StoryboardOptions) -> Self {
        Self {
            transcoder,
            options,
        }
    }

    pub fn options(&self) -> &StoryboardOptions {
        &self.options
    }

    pub fn generate(
        &self,
        layout: &AssetLayout,
        fingerprint: &Fingerprint,
        source: &Path,
    ) -> Result<Generation> {
        let cue_path = layout.storyboard_cue(fingerprint);
        if cue_path.exists() {
            return Ok(Generation::AlreadyExists(cue_path));
        }

        let tiles = self.options.layout;
        tiles.validate()?;
        let scratch = ScratchDir::create(&layout.scratch_root(), "keyframes")?;
        self.transcoder
            .extract_keyframes(source, tiles.cell, scratch.path())?;
        let images = list_frames(scratch.path())?;
        let timestamps = self.transcoder.keyframe_timestamps(source)?;
        let (images, timestamps) = self.reconcile(images, timestamps)?;
        if timestamps.is_empty() {
            return Err(VidxError::Probe(format!(
                "no keyframes found in {}",
                source.display()
            )));
        }

        fs::create_dir_all(layout.storyboard_dir(fingerprint))?;
        for (page, frames) in images.chunks(tiles.per_page().max(1)).enumerate() {
            let sheet = self.render_page(frames)?;
            let target = layout.sprite_sheet(fingerprint, page);
            write_via_temp(&target, |tmp| {
                encode_jpeg(&sheet, tmp, self.options.jpeg_quality)
            })?;
            debug!(page, frames = frames.len(), "sprite sheet written");
        }

        let cues = build_cues(
            &timestamps,
            &tiles,
            CueTime::from_secs_f64(self.options.last_cue_secs),
            &self.options.sprite_prefix,
        );
        write_atomic(&cue_path, cue::render(&cues).as_bytes())?;

        info!(
            fingerprint = %fingerprint,
            keyframes = cues.len(),
            pages = images.len().div_ceil(tiles.per_page().max(1)),
            "storyboard generated"
        );
        Ok(Generation::Created(cue_path))
    }

    fn reconcile(
        &self,
        mut images: Vec<PathBuf>,
        mut timestamps: Vec<f64>,
    ) -> Result<(Vec<PathBuf>, Vec<f64>)> {
        if images.len() == timestamps.len() {
            return Ok((images, timestamps));
        }
        match self.options.reconciliation {
            KeyframeReconciliation::Strict => Err(VidxError::KeyframeMismatch {
                images: images.len(),
                timestamps: timestamps.len(),
            }),
            KeyframeReconciliation::Truncate => {
                let common = images.len().min(timestamps.len());
                warn!(
                    images = images.len(),
                    timestamps = timestamps.len(),
                    "keyframe counts differ, truncating to {common}"
                );
                images.truncate(common);
                timestamps.truncate(common);
                Ok((images, timestamps))
            }
        }
    }

    /// Decode and resample the page's frames in parallel, then paste them
    /// row-major onto a black canvas.
    fn render_page(&self, frames: &[PathBuf]) -> Result<RgbImage> {
        let tiles = self.options.layout;
        let cell = tiles.cell;
        let cells = frames
            .par_iter()
            .map(|path| -> Result<RgbImage> {
                let frame = image::open(path)?.to_rgb8();
                if frame.dimensions() == (cell.width, cell.height) {
                    Ok(frame)
                } else {
                    Ok(imageops::resize(
                        &frame,
                        cell.width,
                        cell.height,
                        FilterType::Nearest,
                    ))
                }
            })
            .collect::<Result<Vec<RgbImage>>>()?;

        let mut canvas =
            RgbImage::from_pixel(
                tiles.sheet_width(),
                tiles.sheet_height(),
                Rgb([0, 0, 0]),
            );
        for (slot, frame) in cells.iter().enumerate() {
            let position = tiles.position(slot);
            imageops::replace(
                &mut canvas,
                frame,
                i64::from(position.x),
                i64::from(position.y),
            );
        }
        Ok(canvas)
    }
}

/// Numbered frame images in the order the extractor wrote them.
fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"))
        })
        .collect();
    frames.sort();
    Ok(frames)
}

fn encode_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    writer.flush()?;
    Ok(())
}

/// One cue per keyframe. A cue ends where the next keyframe starts; the last
/// one lasts `last_cue`.
pub fn build_cues(
    timestamps: &[f64],
    layout: &TileLayout,
    last_cue: CueTime,
    sprite_prefix: &str,
) -> Vec<Cue> {
    timestamps
        .iter()
        .enumerate()
        .map(|(index, &at)| {
            let start = CueTime::from_secs_f64(at);
            let end = timestamps
                .get(index + 1)
                .map(|&next| CueTime::from_secs_f64(next))
                .unwrap_or_else(|| start.saturating_add(last_cue));
            let tile = layout.position(index);
            let body = format!(
                "{sprite_prefix}{}#xywh={},{},{},{}",
                sprite_sheet_name(tile.page),
                tile.x,
                tile.y,
                layout.cell.width,
                layout.cell.height
            );
            Cue::new(start, end, body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::MockTranscoder;

    fn fp() -> Fingerprint {
        "cd".repeat(32).parse().unwrap()
    }

    fn small_layout() -> TileLayout {
        TileLayout {
            cols: 2,
            rows: 2,
            cell: CellSize {
                width: 16,
                height: 9,
            },
        }
    }

    fn transcoder_with(frames: usize, timestamps: Vec<f64>) -> MockTranscoder {
        let mut mock = MockTranscoder::new();
        mock.expect_extract_keyframes()
            .times(1)
            .returning(move |_, _, dir| {
                for i in 0..frames {
                    // Larger than a cell so tiling has to resample.
                    let shade = Rgb([200, (i * 10) as u8, 0]);
                    let frame = RgbImage::from_pixel(32, 18, shade);
                    frame.save(dir.join(format!("{:05}.jpg", i + 1)))?;
                }
                Ok(())
            });
        mock.expect_keyframe_timestamps()
            .times(1)
            .returning(move |_| Ok(timestamps.clone()));
        mock
    }

    #[test]
    fn positions_follow_row_major_pages() {
        let layout = TileLayout::default();
        assert_eq!(layout.position(0), TilePosition { page: 0, x: 0, y: 0 });
        assert_eq!(layout.position(6), TilePosition { page: 0, x: 160, y: 90 });
        assert_eq!(layout.position(24), TilePosition { page: 0, x: 640, y: 360 });
        assert_eq!(layout.position(25), TilePosition { page: 1, x: 0, y: 0 });
    }

    #[test]
    fn oversized_layouts_are_rejected_without_overflow() {
        let huge = TileLayout {
            cols: 70_000,
            rows: 1,
            cell: CellSize {
                width: 70_000,
                height: 1,
            },
        };
        assert_eq!(huge.sheet_width(), u32::MAX);
        assert_eq!(huge.checked_sheet_size(), None);
        assert!(matches!(huge.validate(), Err(VidxError::Validation(_))));

        let too_wide = TileLayout {
            cols: 410,
            ..TileLayout::default()
        };
        assert_eq!(too_wide.checked_sheet_size(), None);

        let empty = TileLayout {
            rows: 0,
            ..TileLayout::default()
        };
        assert!(empty.validate().is_err());

        assert_eq!(TileLayout::default().checked_sheet_size(), Some((800, 450)));
    }

    #[test]
    fn invalid_layout_fails_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let generator = StoryboardGenerator::new(
            Arc::new(MockTranscoder::new()),
            StoryboardOptions {
                layout: TileLayout {
                    cols: 0,
                    ..TileLayout::default()
                },
                ..StoryboardOptions::default()
            },
        );
        let err = generator
            .generate(&layout, &fp(), Path::new("in.mp4"))
            .unwrap_err();
        assert!(matches!(err, VidxError::Validation(_)));
    }

    #[test]
    fn cue_bodies_reference_sprite_regions() {
        let layout = small_layout();
        let cues = build_cues(
            &[0.0, 2.0, 4.5, 6.0, 8.0],
            &layout,
            CueTime::from_millis(10_000),
            "",
        );
        assert_eq!(cues.len(), 5);
        assert_eq!(cues[0].body, "thumb_L0_001.jpg#xywh=0,0,16,9");
        assert_eq!(cues[3].body, "thumb_L0_001.jpg#xywh=16,9,16,9");
        assert_eq!(cues[4].body, "thumb_L0_002.jpg#xywh=0,0,16,9");
        assert_eq!(cues[1].end, CueTime::from_millis(4_500));
        assert_eq!(cues[4].end, CueTime::from_millis(18_000));
    }

    #[test]
    fn generates_sheets_and_cue_file() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let timestamps = vec![0.0, 1.5, 3.0, 4.5, 6.0];
        let generator = StoryboardGenerator::new(
            Arc::new(transcoder_with(5, timestamps.clone())),
            StoryboardOptions {
                layout: small_layout(),
                ..StoryboardOptions::default()
            },
        );

        let result = generator.generate(&layout, &fp(), Path::new("in.mp4")).unwrap();
        assert!(result.is_created());

        let first = image::open(layout.sprite_sheet(&fp(), 0)).unwrap();
        assert_eq!((first.width(), first.height()), (32, 18));
        assert!(layout.sprite_sheet(&fp(), 1).exists());
        assert!(!layout.sprite_sheet(&fp(), 2).exists());

        let text = fs::read_to_string(layout.storyboard_cue(&fp())).unwrap();
        let mut lines = cue::strip_header(&text).unwrap();
        let mut timings = Vec::new();
        while let Some(line) = lines.next() {
            if let Some((start, end)) = cue::split_timing(line) {
                let body = lines.next().unwrap();
                let (_, region) = body.split_once("#xywh=").unwrap();
                let nums: Vec<u32> = region
                    .split(',')
                    .map(|n| n.parse().unwrap())
                    .collect();
                assert!(nums[0] + nums[2] <= 32 && nums[1] + nums[3] <= 18);
                timings.push((start.to_string(), end.to_string()));
            }
        }
        assert_eq!(timings.len(), timestamps.len());
        assert_eq!(
            timings.last().unwrap(),
            &("00:00:06.000".to_string(), "00:00:16.000".to_string())
        );

        assert_eq!(fs::read_dir(layout.scratch_root()).unwrap().count(), 0);
    }

    #[test]
    fn existing_cue_file_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let cue_path = layout.storyboard_cue(&fp());
        fs::create_dir_all(cue_path.parent().unwrap()).unwrap();
        fs::write(&cue_path, "WEBVTT\n\n").unwrap();

        let generator =
            StoryboardGenerator::new(
                Arc::new(MockTranscoder::new()),
                StoryboardOptions::default(),
            );
        let result = generator.generate(&layout, &fp(), Path::new("in.mp4")).unwrap();
        assert_eq!(result, Generation::AlreadyExists(cue_path));
    }

    #[test]
    fn count_mismatch_fails_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let generator = StoryboardGenerator::new(
            Arc::new(transcoder_with(3, vec![0.0, 1.0])),
            StoryboardOptions {
                layout: small_layout(),
                ..StoryboardOptions::default()
            },
        );
        let err = generator.generate(&layout, &fp(), Path::new("in.mp4")).unwrap_err();
        assert!(matches!(
            err,
            VidxError::KeyframeMismatch {
                images: 3,
                timestamps: 2
            }
        ));
        assert!(!layout.storyboard_cue(&fp()).exists());
    }

    #[test]
    fn truncate_mode_pairs_common_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let generator = StoryboardGenerator::new(
            Arc::new(transcoder_with(3, vec![0.0, 1.0])),
            StoryboardOptions {
                layout: small_layout(),
                reconciliation: KeyframeReconciliation::Truncate,
                ..StoryboardOptions::default()
            },
        );
        generator.generate(&layout, &fp(), Path::new("in.mp4")).unwrap();
        let text = fs::read_to_string(layout.storyboard_cue(&fp())).unwrap();
        assert_eq!(text.matches(cue::RANGE_SEPARATOR).count(), 2);
    }

    #[test]
    fn no_keyframes_is_a_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = AssetLayout::new(dir.path(), "webm");
        let generator = StoryboardGenerator::new(
            Arc::new(transcoder_with(0, Vec::new())),
            StoryboardOptions::default(),
        );
        let err = generator.generate(&layout, &fp(), Path::new("in.mp4")).unwrap_err();
        assert!(matches!(err, VidxError::Probe(_)));
    }
}
