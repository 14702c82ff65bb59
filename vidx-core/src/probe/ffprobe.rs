use std::ffi::OsStr;
use std::path::Path;

use serde::Deserialize;

use super::{ProbeReport, Prober, Rational, TrackInfo, TrackKind};
use crate::error::{Result, VidxError};
use crate::transcode::ToolRunner;

/// Prober backed by the `ffprobe` JSON report.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    runner: ToolRunner,
}

impl FfprobeProber {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeJson {
    #[serde(default)]
    format: Option<FormatJson>,
    #[serde(default)]
    streams: Vec<StreamJson>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamJson {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    codec_tag_string: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

/// Convert an `ffprobe -show_format -show_streams` JSON report.
pub fn parse_report(json: &str) -> Result<ProbeReport> {
    let parsed: FfprobeJson = serde_json::from_str(json)
        .map_err(|err| VidxError::Probe(format!("invalid ffprobe json: {err}")))?;

    let format = parsed
        .format
        .ok_or_else(|| VidxError::Probe("ffprobe report has no format".to_string()))?;

    let duration_ms = format
        .duration
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0).round() as u64)
        .unwrap_or(0);

    let tracks = parsed
        .streams
        .into_iter()
        .map(|stream| {
            let kind = match stream.codec_type.as_deref() {
                Some("video") => TrackKind::Video,
                Some("audio") => TrackKind::Audio,
                _ => TrackKind::Other,
            };
            let codec = stream
                .codec_tag_string
                .filter(|tag| !tag.is_empty() && !tag.starts_with('['))
                .or(stream.codec_name)
                .unwrap_or_default();
            TrackInfo {
                kind,
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
                codec,
            }
        })
        .collect();

    Ok(ProbeReport {
        format: format
            .format_name
            .as_deref()
            .and_then(|name| name.split(',').next())
            .unwrap_or_default()
            .to_string(),
        duration_ms,
        fragmented: false,
        tracks,
    })
}

impl Prober for FfprobeProber {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let output = self.runner.run([
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_format"),
            OsStr::new("-show_streams"),
            path.as_os_str(),
        ])?;
        parse_report(output.stdout_text()?)
    }

    fn frame_rate(&self, path: &Path) -> Result<Option<Rational>> {
        let output = self.runner.run([
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-select_streams"),
            OsStr::new("v:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=r_frame_rate"),
            OsStr::new("-of"),
            OsStr::new("default=noprint_wrappers=1:nokey=1"),
            path.as_os_str(),
        ])?;
        Ok(output
            .stdout_text()?
            .lines()
            .find_map(|line| line.trim().parse::<Rational>().ok()))
    }
}
