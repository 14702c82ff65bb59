//! Cue-index text format shared by storyboards and markers.
//!
//! ```text
//! WEBVTT
//!
//! 00:00:00.000 --> 00:00:04.000
//! thumb_L0_001.jpg#xywh=0,0,160,90
//!
//! ```

use std::fmt;
use std::time::Duration;

use crate::error::{Result, VidxError};

/// Header line; the file continues with one empty line before the first cue.
pub const HEADER: &str = "WEBVTT";

pub const RANGE_SEPARATOR: &str = " --> ";

/// A cue timestamp with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CueTime(u64);

impl CueTime {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self(0);
        }
        Self((secs * 1000.0).round() as u64)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// `(hours, minutes, seconds, millis)`
    pub const fn components(&self) -> (u64, u64, u64, u64) {
        let total_secs = self.0 / 1000;
        (
            total_secs / 3600,
            (total_secs % 3600) / 60,
            total_secs % 60,
            self.0 % 1000,
        )
    }

    pub fn saturating_add(self, other: CueTime) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl From<Duration> for CueTime {
    fn from(value: Duration) -> Self {
        Self(value.as_millis().min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for CueTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (h, m, s, ms) = self.components();
        write!(f, "{h:02}:{m:02}:{s:02}.{ms:03}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start: CueTime,
    pub end: CueTime,
    pub body: String,
}

impl Cue {
    pub fn new(start: CueTime, end: CueTime, body: impl Into<String>) -> Self {
        Self {
            start,
            end,
            body: body.into(),
        }
    }

    pub fn timing_line(&self) -> String {
        format!("{}{RANGE_SEPARATOR}{}", self.start, self.end)
    }
}

/// Serialize a complete cue file.
pub fn render(cues: &[Cue]) -> String {
    let mut out = String::with_capacity(16 + cues.len() * 64);
    out.push_str(HEADER);
    out.push_str("\n\n");
    for cue in cues {
        out.push_str(&cue.timing_line());
        out.push('\n');
        out.push_str(&cue.body);
        out.push_str("\n\n");
    }
    out
}

/// Split a timing line into its raw start and end fields.
pub fn split_timing(line: &str) -> Option<(&str, &str)> {
    let (start, end) = line.split_once("-->")?;
    let end = end.split_whitespace().next().unwrap_or("");
    Some((start.trim(), end))
}

/// Check the two-line header and return the remaining lines.
pub fn strip_header(contents: &str) -> Result<std::str::Lines<'_>> {
    let mut lines = contents.lines();
    let first = lines
        .next()
        .map(|line| line.trim_start_matches('\u{feff}').trim_end());
    if first != Some(HEADER) {
        return Err(VidxError::Validation(
            "cue file is missing its WEBVTT header".to_string(),
        ));
    }
    match lines.next() {
        None => Ok(lines),
        Some(second) if second.trim().is_empty() => Ok(lines),
        Some(_) => Err(VidxError::Validation(
            "cue file header must be followed by an empty line".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hours_minutes_seconds_millis() {
        assert_eq!(CueTime::from_millis(0).to_string(), "00:00:00.000");
        assert_eq!(CueTime::from_millis(65_000).to_string(), "00:01:05.000");
        assert_eq!(
            CueTime::from_secs_f64(3723.4567).to_string(),
            "01:02:03.457"
        );
        assert_eq!(
            CueTime::from_millis(100 * 3600 * 1000).to_string(),
            "100:00:00.000"
        );
    }

    #[test]
    fn negative_and_nan_seconds_clamp_to_zero() {
        assert_eq!(CueTime::from_secs_f64(-1.0), CueTime::from_millis(0));
        assert_eq!(CueTime::from_secs_f64(f64::NAN), CueTime::from_millis(0));
    }

    #[test]
    fn renders_header_and_blocks() {
        let cues = vec![
            Cue::new(CueTime::from_millis(0), CueTime::from_millis(1500), "a"),
            Cue::new(CueTime::from_millis(1500), CueTime::from_millis(3000), "b"),
        ];
        assert_eq!(
            render(&cues),
            "WEBVTT\n\n\
             00:00:00.000 --> 00:00:01.500\na\n\n\
             00:00:01.500 --> 00:00:03.000\nb\n\n"
        );
        assert_eq!(render(&[]), "WEBVTT\n\n");
    }

    #[test]
    fn header_is_required() {
        assert!(strip_header("WEBVTT\n\nrest").is_ok());
        assert!(strip_header("WEBVTT").is_ok());
        assert!(strip_header("\u{feff}WEBVTT\n\n").is_ok());
        assert!(strip_header("").is_err());
        assert!(strip_header("NOT VTT\n\n").is_err());
        assert!(strip_header("WEBVTT\nfoo\n").is_err());
    }

    #[test]
    fn splits_timing_lines() {
        assert_eq!(
            split_timing("00:01:05.000 --> 00:01:11.000 align:start"),
            Some(("00:01:05.000", "00:01:11.000"))
        );
        assert_eq!(split_timing("Intro"), None);
    }
}
