//! Content-addressed derived assets.
//!
//! Every asset lives under `<root>/<kind>/<fp[:2]>/`. The presence of the
//! terminal file is the only idempotence marker, so each output is produced
//! under a temporary name and renamed into place once complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::fsutil::write_via_temp;
use crate::identity::Fingerprint;
use crate::probe::CodecRecord;
use crate::storyboard::{StoryboardGenerator, sprite_sheet_name};
use crate::transcode::{PreviewClip, Transcoder};

pub const STORYBOARD_CUE_FILE: &str = "thumbnails.vtt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    Thumbnail,
    Preview,
    Storyboard,
    Markers,
}

impl AssetKind {
    pub const ALL: [AssetKind; 4] = [
        AssetKind::Thumbnail,
        AssetKind::Preview,
        AssetKind::Storyboard,
        AssetKind::Markers,
    ];

    /// Top-level directory name under the asset root.
    pub fn dir_name(self) -> &'static str {
        match self {
            AssetKind::Thumbnail => "thumbnails",
            AssetKind::Preview => "previews",
            AssetKind::Storyboard => "preview_thumbnails",
            AssetKind::Markers => "video_markers",
        }
    }
}

/// Paths of the derived assets of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAssetSet {
    pub thumbnail: PathBuf,
    pub preview: PathBuf,
    pub storyboard_dir: PathBuf,
    pub storyboard_cue: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AssetLayout {
    root: PathBuf,
    preview_extension: String,
}

impl AssetLayout {
    pub fn new(root: impl Into<PathBuf>, preview_extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            preview_extension: preview_extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_dir(&self, kind: AssetKind, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(kind.dir_name()).join(fingerprint.shard())
    }

    pub fn thumbnail(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(AssetKind::Thumbnail, fingerprint)
            .join(format!("{fingerprint}.jpg"))
    }

    pub fn preview(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(AssetKind::Preview, fingerprint)
            .join(format!("{fingerprint}.{}", self.preview_extension))
    }

    pub fn storyboard_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(AssetKind::Storyboard, fingerprint)
            .join(fingerprint.as_str())
    }

    pub fn storyboard_cue(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.storyboard_dir(fingerprint).join(STORYBOARD_CUE_FILE)
    }

    /// Sprite sheet for a zero-based page index.
    pub fn sprite_sheet(&self, fingerprint: &Fingerprint, page: usize) -> PathBuf {
        self.storyboard_dir(fingerprint).join(sprite_sheet_name(page))
    }

    pub fn markers(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.shard_dir(AssetKind::Markers, fingerprint)
            .join(format!("{fingerprint}.vtt"))
    }

    /// Parent of transient working directories. Hidden so a library scan
    /// rooted at the same place never picks it up.
    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(".scratch")
    }

    pub fn asset_set(&self, fingerprint: &Fingerprint) -> DerivedAssetSet {
        DerivedAssetSet {
            thumbnail: self.thumbnail(fingerprint),
            preview: self.preview(fingerprint),
            storyboard_dir: self.storyboard_dir(fingerprint),
            storyboard_cue: self.storyboard_cue(fingerprint),
        }
    }
}

/// Outcome of an idempotent generation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Created(PathBuf),
    AlreadyExists(PathBuf),
}

impl Generation {
    pub fn path(&self) -> &Path {
        match self {
            Generation::Created(path) | Generation::AlreadyExists(path) => path,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Generation::Created(_))
    }
}

#[derive(Debug, Clone)]
pub struct AssetReport {
    pub thumbnail: Generation,
    pub preview: Generation,
    pub storyboard: Generation,
}

impl AssetReport {
    pub fn created(&self) -> usize {
        [&self.thumbnail, &self.preview, &self.storyboard]
            .iter()
            .filter(|g| g.is_created())
            .count()
    }

    /// True when no asset had to be generated.
    pub fn all_existed(&self) -> bool {
        self.created() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetOptions {
    pub thumbnail_width: u32,
    pub preview_width: u32,
    pub preview_seconds: f64,
}

impl Default for AssetOptions {
    fn default() -> Self {
        Self {
            thumbnail_width: 320,
            preview_width: 320,
            preview_seconds: 4.0,
        }
    }
}

pub struct DerivedAssetGenerator {
    layout: AssetLayout,
    options: AssetOptions,
    transcoder: Arc<dyn Transcoder>,
    storyboard: StoryboardGenerator,
}

impl std::fmt::Debug for DerivedAssetGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedAssetGenerator")
            .field("layout", &self.layout)
            .field("options", &self.options)
            .field("storyboard", &self.storyboard)
            .finish_non_exhaustive()
    }
}

impl DerivedAssetGenerator {
    pub fn new(
        layout: AssetLayout,
        options: AssetOptions,
        transcoder: Arc<dyn Transcoder>,
        storyboard: StoryboardGenerator,
    ) -> Self {
        Self {
            layout,
            options,
            transcoder,
            storyboard,
        }
    }

    pub fn layout(&self) -> &AssetLayout {
        &self.layout
    }

    /// Generate whichever of thumbnail, preview and storyboard is missing.
    ///
    /// Every asset is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub fn ensure_all(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        codec: &CodecRecord,
    ) -> Result<AssetReport> {
        let thumbnail = self.ensure_thumbnail(fingerprint, source, codec);
        let preview = self.ensure_preview(fingerprint, source, codec);
        let storyboard = self.ensure_storyboard(fingerprint, source);
        for (kind, outcome) in [
            (AssetKind::Thumbnail, &thumbnail),
            (AssetKind::Preview, &preview),
            (AssetKind::Storyboard, &storyboard),
        ] {
            if let Err(err) = outcome {
                warn!(
                    fingerprint = %fingerprint,
                    asset = ?kind,
                    "asset generation failed: {err}"
                );
            }
        }

        let report = AssetReport {
            thumbnail: thumbnail?,
            preview: preview?,
            storyboard: storyboard?,
        };
        info!(
            fingerprint = %fingerprint,
            created = report.created(),
            "derived assets ensured"
        );
        Ok(report)
    }

    pub fn ensure_thumbnail(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        codec: &CodecRecord,
    ) -> Result<Generation> {
        let target = self.layout.thumbnail(fingerprint);
        if target.exists() {
            return Ok(Generation::AlreadyExists(target));
        }
        let at_secs = codec.duration_sec as f64 / 2.0;
        write_via_temp(&target, |tmp| {
            self.transcoder
                .capture_frame(source, at_secs, self.options.thumbnail_width, tmp)
        })?;
        debug!(
            fingerprint = %fingerprint,
            path = %target.display(),
            "thumbnail written"
        );
        Ok(Generation::Created(target))
    }

    pub fn ensure_preview(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
        codec: &CodecRecord,
    ) -> Result<Generation> {
        let target = self.layout.preview(fingerprint);
        if target.exists() {
            return Ok(Generation::AlreadyExists(target));
        }
        let clip = self.preview_clip(codec);
        write_via_temp(&target, |tmp| {
            self.transcoder.encode_preview(source, &clip, tmp)
        })?;
        debug!(
            fingerprint = %fingerprint,
            path = %target.display(),
            "preview written"
        );
        Ok(Generation::Created(target))
    }

    pub fn ensure_storyboard(
        &self,
        fingerprint: &Fingerprint,
        source: &Path,
    ) -> Result<Generation> {
        self.storyboard.generate(&self.layout, fingerprint, source)
    }

    /// Clip of `preview_seconds` centred on the middle of the video.
    pub fn preview_clip(&self, codec: &CodecRecord) -> PreviewClip {
        let length = self.options.preview_seconds;
        let middle = codec.duration_sec as f64 / 2.0;
        PreviewClip {
            start_secs: (middle - length / 2.0).max(0.0),
            length_secs: length,
            width: self.options.preview_width,
        }
    }

    /// Delete thumbnail, preview and storyboard of an identity. Returns how
    /// many of them existed.
    pub fn remove_all(&self, fingerprint: &Fingerprint) -> Result<usize> {
        let set = self.layout.asset_set(fingerprint);
        let mut removed = 0;
        for file in [&set.thumbnail, &set.preview] {
            match fs::remove_file(file) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        match fs::remove_dir_all(&set.storyboard_dir) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        info!(fingerprint = %fingerprint, removed, "derived assets removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VidxError;
    use crate::storyboard::StoryboardOptions;
    use crate::transcode::MockTranscoder;

    fn fp() -> Fingerprint {
        "ab".repeat(32).parse().unwrap()
    }

    fn codec(duration_sec: u64) -> CodecRecord {
        CodecRecord {
            duration_sec,
            ..CodecRecord::default()
        }
    }

    fn generator(root: &Path, mock: MockTranscoder) -> DerivedAssetGenerator {
        let transcoder: Arc<dyn Transcoder> = Arc::new(mock);
        DerivedAssetGenerator::new(
            AssetLayout::new(root, "webm"),
            AssetOptions::default(),
            transcoder.clone(),
            StoryboardGenerator::new(transcoder, StoryboardOptions::default()),
        )
    }

    #[test]
    fn layout_is_sharded_by_fingerprint_prefix() {
        let layout = AssetLayout::new("/assets", "webm");
        let fp = fp();
        let hex = fp.as_str();
        assert_eq!(
            layout.thumbnail(&fp),
            PathBuf::from(format!("/assets/thumbnails/ab/{hex}.jpg"))
        );
        assert_eq!(
            layout.preview(&fp),
            PathBuf::from(format!("/assets/previews/ab/{hex}.webm"))
        );
        assert_eq!(
            layout.storyboard_cue(&fp),
            PathBuf::from(format!("/assets/preview_thumbnails/ab/{hex}/thumbnails.vtt"))
        );
        assert_eq!(
            layout.sprite_sheet(&fp, 0),
            PathBuf::from(format!("/assets/preview_thumbnails/ab/{hex}/thumb_L0_001.jpg"))
        );
        assert_eq!(
            layout.markers(&fp),
            PathBuf::from(format!("/assets/video_markers/ab/{hex}.vtt"))
        );
    }

    #[test]
    fn thumbnail_is_captured_at_half_duration_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockTranscoder::new();
        mock.expect_capture_frame()
            .withf(|_, at, width, _| *at == 50.0 && *width == 320)
            .times(1)
            .returning(|_, _, _, out| fs::write(out, b"jpeg").map_err(Into::into));

        let generator = generator(dir.path(), mock);
        let first = generator
            .ensure_thumbnail(&fp(), Path::new("in.mp4"), &codec(100))
            .unwrap();
        assert!(first.is_created());
        assert_eq!(fs::read(first.path()).unwrap(), b"jpeg");

        let second = generator
            .ensure_thumbnail(&fp(), Path::new("in.mp4"), &codec(100))
            .unwrap();
        assert_eq!(second, Generation::AlreadyExists(first.path().to_path_buf()));
    }

    #[test]
    fn failed_capture_leaves_no_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockTranscoder::new();
        mock.expect_capture_frame().times(1).returning(|_, _, _, out| {
            fs::write(out, b"partial")?;
            Err(VidxError::ExternalTool {
                tool: "ffmpeg".into(),
                status: "exit status: 1".into(),
                stderr: "bad input".into(),
            })
        });

        let generator = generator(dir.path(), mock);
        let err = generator
            .ensure_thumbnail(&fp(), Path::new("in.mp4"), &codec(10))
            .unwrap_err();
        assert!(matches!(err, VidxError::ExternalTool { .. }));
        let shard = generator.layout().shard_dir(AssetKind::Thumbnail, &fp());
        assert_eq!(fs::read_dir(shard).unwrap().count(), 0);
    }

    #[test]
    fn ensure_all_attempts_every_asset_and_reports_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockTranscoder::new();
        mock.expect_capture_frame().times(1).returning(|_, _, _, _| {
            Err(VidxError::ExternalTool {
                tool: "ffmpeg".into(),
                status: "exit status: 1".into(),
                stderr: "no video stream".into(),
            })
        });
        mock.expect_encode_preview()
            .times(1)
            .returning(|_, _, out| fs::write(out, b"webm").map_err(Into::into));
        mock.expect_extract_keyframes()
            .times(1)
            .returning(|_, _, _| Err(VidxError::Cancelled("stopped".into())));

        let generator = generator(dir.path(), mock);
        let err = generator
            .ensure_all(&fp(), Path::new("in.mp4"), &codec(100))
            .unwrap_err();
        assert!(matches!(err, VidxError::ExternalTool { .. }));

        let set = generator.layout().asset_set(&fp());
        assert!(!set.thumbnail.exists());
        assert_eq!(fs::read(&set.preview).unwrap(), b"webm");
        assert!(!set.storyboard_cue.exists());
    }

    #[test]
    fn preview_clip_is_centred_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path(), MockTranscoder::new());
        let clip = generator.preview_clip(&codec(100));
        assert_eq!(clip.start_secs, 48.0);
        assert_eq!(clip.length_secs, 4.0);
        assert_eq!(clip.width, 320);
        assert_eq!(generator.preview_clip(&codec(1)).start_secs, 0.0);
    }

    #[test]
    fn remove_all_deletes_existing_assets() {
        let dir = tempfile::tempdir().unwrap();
        let generator = generator(dir.path(), MockTranscoder::new());
        let set = generator.layout().asset_set(&fp());
        fs::create_dir_all(&set.storyboard_dir).unwrap();
        fs::write(&set.storyboard_cue, "WEBVTT\n\n").unwrap();
        fs::create_dir_all(set.thumbnail.parent().unwrap()).unwrap();
        fs::write(&set.thumbnail, b"jpeg").unwrap();

        assert_eq!(generator.remove_all(&fp()).unwrap(), 2);
        assert!(!set.thumbnail.exists());
        assert!(!set.storyboard_dir.exists());
        assert_eq!(generator.remove_all(&fp()).unwrap(), 0);
    }
}
