//! Technical metadata extraction.
//!
//! A [`MetadataExtractor`] asks its probers in order. The ISO-BMFF box reader
//! answers for MP4 family files without spawning anything; `ffprobe` covers
//! every other container and supplies the frame-rate fraction.

mod ffprobe;
mod mp4;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use ffprobe::{FfprobeProber, parse_report as parse_ffprobe_report};
pub use mp4::Mp4BoxProber;

use crate::error::{Result, VidxError};
use crate::pool::WorkerPool;
use crate::transcode::ToolRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub kind: TrackKind,
    /// Display width in pixels, 0 for non-visual tracks.
    pub width: u32,
    pub height: u32,
    /// Sample description identifier, e.g. `avc1` or `mp4a`.
    pub codec: String,
}

/// Structured report produced by a single prober.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub format: String,
    pub duration_ms: u64,
    pub fragmented: bool,
    pub tracks: Vec<TrackInfo>,
}

impl ProbeReport {
    pub fn first_track(&self, kind: TrackKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|track| track.kind == kind)
    }
}

/// Frame-rate fraction as reported by the prober, e.g. `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u64,
    pub den: u64,
}

impl Rational {
    pub fn new(num: u64, den: u64) -> Self {
        Self { num, den }
    }

    /// `None` for a zero denominator (`0/0` means unknown).
    pub fn to_f64(self) -> Option<f64> {
        (self.den != 0).then(|| self.num as f64 / self.den as f64)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Rational {
    type Err = VidxError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || VidxError::Probe(format!("invalid frame rate '{s}'"));
        let s = s.trim();
        match s.split_once('/') {
            Some((num, den)) => Ok(Self {
                num: num.trim().parse().map_err(|_| invalid())?,
                den: den.trim().parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self {
                num: s.parse().map_err(|_| invalid())?,
                den: 1,
            }),
        }
    }
}

/// Wrapper around an external or built-in analysis backend.
pub trait Prober: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, path: &Path) -> bool;

    fn probe(&self, path: &Path) -> Result<ProbeReport>;

    /// Frame-rate fraction of the first video stream, when this backend can
    /// tell.
    fn frame_rate(&self, _path: &Path) -> Result<Option<Rational>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Per-identity codec summary attached to a video record at index time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecRecord {
    pub format: String,
    pub duration_sec: u64,
    /// Frames per second rounded to two decimals; 0.0 when unknown.
    pub frame_rate: f64,
    pub is_fragment: bool,
    pub resolution: Resolution,
    pub video_codec: String,
    pub audio_codec: String,
}

impl CodecRecord {
    pub fn from_report(report: &ProbeReport, frame_rate: Option<Rational>) -> Self {
        let video = report.first_track(TrackKind::Video);
        let audio = report.first_track(TrackKind::Audio);
        Self {
            format: report.format.clone(),
            duration_sec: report.duration_ms / 1000,
            frame_rate: frame_rate
                .and_then(Rational::to_f64)
                .map(round2)
                .unwrap_or(0.0),
            is_fragment: report.fragmented,
            resolution: video
                .map(|track| Resolution {
                    width: track.width,
                    height: track.height,
                })
                .unwrap_or_default(),
            video_codec: video.map(|track| track.codec.clone()).unwrap_or_default(),
            audio_codec: audio.map(|track| track.codec.clone()).unwrap_or_default(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct MetadataExtractor {
    probers: Vec<Box<dyn Prober>>,
    pool: WorkerPool,
}

impl fmt::Debug for MetadataExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataExtractor")
            .field(
                "probers",
                &self.probers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("pool", &self.pool)
            .finish()
    }
}

impl MetadataExtractor {
    /// Probers are consulted in the given order.
    pub fn new(probers: Vec<Box<dyn Prober>>, workers: usize) -> Self {
        Self {
            probers,
            pool: WorkerPool::new("metadata", workers),
        }
    }

    /// Box reader first, `ffprobe` as fallback and frame-rate source.
    pub fn with_ffprobe(ffprobe: ToolRunner, workers: usize) -> Self {
        Self::new(
            vec![
                Box::new(Mp4BoxProber::new()),
                Box::new(FfprobeProber::new(ffprobe)),
            ],
            workers,
        )
    }

    pub fn extract(&self, path: &Path) -> Result<CodecRecord> {
        if !path.is_file() {
            return Err(VidxError::NotFound(format!(
                "source file {}",
                path.display()
            )));
        }
        let report = self.probe(path)?;
        let frame_rate = self.frame_rate(path)?;
        let record = CodecRecord::from_report(&report, frame_rate);
        debug!(
            path = %path.display(),
            format = %record.format,
            duration = record.duration_sec,
            "extracted codec record"
        );
        Ok(record)
    }

    /// Extract every path on the metadata pool. Results come back in
    /// completion order; paths never dispatched after `cancel` fires are
    /// reported as cancelled.
    pub fn extract_many(
        &self,
        paths: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Vec<(PathBuf, Result<CodecRecord>)> {
        let mut results = Vec::with_capacity(paths.len());
        let undispatched = self.pool.execute(
            paths,
            cancel,
            |path| self.extract(path),
            |path, result| results.push((path, result)),
        );
        results.extend(undispatched.into_iter().map(|path| {
            let err = VidxError::Cancelled(format!("{} not probed", path.display()));
            (path, Err(err))
        }));
        results
    }

    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let mut last_err = None;
        for prober in self.probers.iter().filter(|p| p.supports(path)) {
            match prober.probe(path) {
                Ok(report) => return Ok(report),
                Err(err @ VidxError::Cancelled(_)) => return Err(err),
                Err(err) => {
                    debug!(
                        prober = prober.name(),
                        path = %path.display(),
                        "prober failed, trying next: {err}"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            VidxError::Probe(format!("no prober supports {}", path.display()))
        }))
    }

    fn frame_rate(&self, path: &Path) -> Result<Option<Rational>> {
        for prober in self.probers.iter().filter(|p| p.supports(path)) {
            match prober.frame_rate(path) {
                Ok(Some(rate)) => return Ok(Some(rate)),
                Ok(None) => {}
                Err(err @ VidxError::Cancelled(_)) => return Err(err),
                Err(err) => {
                    warn!(
                        prober = prober.name(),
                        path = %path.display(),
                        "frame rate probe failed: {err}"
                    );
                }
            }
        }
        Ok(None)
    }
}
