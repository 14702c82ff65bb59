//! User-authored timeline markers, stored per identity as a cue file whose
//! bodies are plain titles.
//!
//! Marker times have whole-second resolution. Fractional seconds in a stored
//! file are dropped on read, and deletion matches on the formatted
//! `HH:MM:SS.000` start, so markers within the same second are not told
//! apart.

use std::fmt;
use std::fs;
use std::io;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::assets::AssetLayout;
use crate::cue::{self, Cue, CueTime};
use crate::error::{Result, VidxError};
use crate::fsutil::write_atomic;
use crate::identity::Fingerprint;

const CUE_SHARE: f64 = 0.03;
const MIN_CUE_SECS: f64 = 0.2;
const MAX_CUE_SECS: f64 = 15.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub title: String,
}

impl Marker {
    pub fn new(
        hour: u32,
        minute: u32,
        second: u32,
        title: impl Into<String>,
    ) -> Result<Self> {
        let marker = Self {
            hour,
            minute,
            second,
            title: title.into(),
        };
        marker.validate()?;
        Ok(marker)
    }

    /// Build a marker from an absolute offset in seconds.
    pub fn at_seconds(total: u64, title: impl Into<String>) -> Result<Self> {
        let hour = u32::try_from(total / 3600)
            .map_err(|_| {
                VidxError::Validation(format!(
                    "marker offset {total}s out of range"
                ))
            })?;
        Self::new(hour, ((total % 3600) / 60) as u32, (total % 60) as u32, title)
    }

    pub fn validate(&self) -> Result<()> {
        if self.minute >= 60 || self.second >= 60 {
            return Err(VidxError::Validation(format!(
                "invalid marker time {}:{}:{}",
                self.hour, self.minute, self.second
            )));
        }
        let title = self.title.trim();
        if title.is_empty() {
            return Err(VidxError::Validation("marker title is empty".to_string()));
        }
        if title.contains(['\n', '\r']) || title.contains("-->") {
            return Err(VidxError::Validation(format!(
                "marker title {:?} cannot be stored in a cue file",
                self.title
            )));
        }
        Ok(())
    }

    pub fn total_seconds(&self) -> u64 {
        u64::from(self.hour) * 3600 + u64::from(self.minute) * 60 + u64::from(self.second)
    }

    pub fn start(&self) -> CueTime {
        CueTime::from_millis(self.total_seconds() * 1000)
    }

    /// `HH:MM:SS.000`, the key used for deletion.
    pub fn timestamp(&self) -> String {
        self.start().to_string()
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp(), self.title)
    }
}

/// Parse `SS`, `MM:SS` or `HH:MM:SS`, each optionally followed by a
/// fractional part that is discarded. Returns whole seconds.
pub fn parse_timestamp(raw: &str) -> Result<u64> {
    let invalid = || VidxError::Validation(format!("invalid timestamp '{raw}'"));
    let whole = raw.trim().split('.').next().unwrap_or_default();
    let parts = whole
        .split(':')
        .map(|part| part.trim().parse::<u64>().map_err(|_| invalid()))
        .collect::<Result<Vec<u64>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [s] => (0, 0, *s),
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(invalid()),
    };
    hours
        .checked_mul(3600)
        .and_then(|h| minutes.checked_mul(60).and_then(|m| h.checked_add(m)))
        .and_then(|hm| hm.checked_add(seconds))
        .ok_or_else(invalid)
}

/// Cue length for markers on a video of `duration_sec`: 3% of the runtime,
/// kept between 0.2 and 15 seconds.
pub fn cue_length(duration_sec: f64) -> CueTime {
    let secs = if duration_sec.is_finite() {
        duration_sec * CUE_SHARE
    } else {
        0.0
    };
    CueTime::from_secs_f64(secs.clamp(MIN_CUE_SECS, MAX_CUE_SECS))
}

enum ReadState {
    Timing,
    Title(u64),
}

/// Read markers from cue-file text.
pub fn parse_markers(text: &str) -> Result<Vec<Marker>> {
    let mut markers = Vec::new();
    let mut state = ReadState::Timing;
    for line in cue::strip_header(text)? {
        state = match state {
            ReadState::Timing => match cue::split_timing(line) {
                Some((start, _)) => ReadState::Title(parse_timestamp(start)?),
                None => {
                    if !line.trim().is_empty() {
                        debug!(line, "skipping non-timing line in marker file");
                    }
                    ReadState::Timing
                }
            },
            ReadState::Title(start) => {
                let title = line.trim();
                if title.is_empty() {
                    debug!(start, "dropping marker without a title");
                } else {
                    markers.push(Marker::at_seconds(start, title)?);
                }
                ReadState::Timing
            }
        };
    }
    Ok(markers)
}

/// Sort `markers` by start and serialize them for a video of
/// `duration_sec`.
pub fn render_markers(markers: &mut [Marker], duration_sec: f64) -> String {
    markers.sort_by_key(Marker::total_seconds);
    let length = cue_length(duration_sec);
    let cues: Vec<Cue> = markers
        .iter()
        .map(|marker| {
            let start = marker.start();
            Cue::new(start, start.saturating_add(length), marker.title.trim())
        })
        .collect();
    cue::render(&cues)
}

/// File-backed marker lists under `video_markers/`.
///
/// One lock guards the whole collection; every read-modify-write holds it
/// from load to save.
#[derive(Debug)]
pub struct MarkerStore {
    layout: AssetLayout,
    lock: Mutex<()>,
}

impl MarkerStore {
    pub fn new(layout: AssetLayout) -> Self {
        Self {
            layout,
            lock: Mutex::new(()),
        }
    }

    /// Markers of `fingerprint`, or an empty list when none were saved.
    pub fn list(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>> {
        let _guard = self.lock.lock();
        self.load(fingerprint)
    }

    /// Add a marker and rewrite the sorted list. Returns the stored list.
    pub fn add(
        &self,
        fingerprint: &Fingerprint,
        marker: Marker,
        duration_sec: u64,
    ) -> Result<Vec<Marker>> {
        self.add_then(fingerprint, marker, duration_sec, |_| Ok(()))
    }

    /// Like [`MarkerStore::add`], running `saved` on the stored list before
    /// the collection lock is released.
    pub fn add_then<F>(
        &self,
        fingerprint: &Fingerprint,
        marker: Marker,
        duration_sec: u64,
        saved: F,
    ) -> Result<Vec<Marker>>
    where
        F: FnOnce(&[Marker]) -> Result<()>,
    {
        marker.validate()?;
        let _guard = self.lock.lock();
        let mut markers = self.load(fingerprint)?;
        markers.push(marker);
        self.save(fingerprint, &mut markers, duration_sec)?;
        saved(&markers)?;
        Ok(markers)
    }

    /// Remove every marker whose formatted start equals the one of
    /// `hour:minute:second`.
    pub fn delete_one(
        &self,
        fingerprint: &Fingerprint,
        hour: u32,
        minute: u32,
        second: u32,
        duration_sec: u64,
    ) -> Result<Vec<Marker>> {
        self.delete_one_then(
            fingerprint,
            (hour, minute, second),
            duration_sec,
            |_| Ok(()),
        )
    }

    /// Like [`MarkerStore::delete_one`] with `(hour, minute, second)`,
    /// running `saved` on the remaining list under the collection lock.
    pub fn delete_one_then<F>(
        &self,
        fingerprint: &Fingerprint,
        (hour, minute, second): (u32, u32, u32),
        duration_sec: u64,
        saved: F,
    ) -> Result<Vec<Marker>>
    where
        F: FnOnce(&[Marker]) -> Result<()>,
    {
        let key = CueTime::from_millis(
            (u64::from(hour) * 3600 + u64::from(minute) * 60 + u64::from(second))
                * 1000,
        )
        .to_string();

        let _guard = self.lock.lock();
        let mut markers = self.load(fingerprint)?;
        let before = markers.len();
        markers.retain(|marker| marker.timestamp() != key);
        if markers.len() == before {
            return Err(VidxError::NotFound(format!(
                "marker at {key} for {fingerprint}"
            )));
        }
        self.save(fingerprint, &mut markers, duration_sec)?;
        saved(&markers)?;
        Ok(markers)
    }

    /// Drop the marker file. Missing files are fine.
    pub fn delete_all(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.delete_all_then(fingerprint, || Ok(()))
    }

    /// Like [`MarkerStore::delete_all`], running `removed` under the
    /// collection lock.
    pub fn delete_all_then<F>(
        &self,
        fingerprint: &Fingerprint,
        removed: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let _guard = self.lock.lock();
        match fs::remove_file(self.layout.markers(fingerprint)) {
            Ok(()) => info!(fingerprint = %fingerprint, "markers removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        removed()
    }

    fn load(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>> {
        match fs::read_to_string(self.layout.markers(fingerprint)) {
            Ok(text) => parse_markers(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(
        &self,
        fingerprint: &Fingerprint,
        markers: &mut [Marker],
        duration_sec: u64,
    ) -> Result<()> {
        let text = render_markers(markers, duration_sec as f64);
        write_atomic(&self.layout.markers(fingerprint), text.as_bytes())?;
        debug!(fingerprint = %fingerprint, count = markers.len(), "markers saved");
        Ok(())
    }
}
