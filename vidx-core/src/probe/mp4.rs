//! Minimal ISO base media (MP4/MOV) box reader.
//!
//! Only the boxes needed for a [`ProbeReport`] are decoded: `ftyp`,
//! `moov/mvhd`, `moov/mvex` (+`mehd`), and per track `tkhd`,
//! `mdia/hdlr` and the first `stsd` sample entry. Media data is never read.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::{ProbeReport, Prober, TrackInfo, TrackKind};
use crate::error::{Result, VidxError};

/// `moov` payloads above this size are rejected rather than buffered.
const MAX_MOOV_BYTES: u64 = 64 * 1024 * 1024;

/// Track header dimensions are 16.16 fixed point.
const FIXED_16_16: u32 = 1 << 16;

#[derive(Debug, Default, Clone, Copy)]
pub struct Mp4BoxProber;

impl Mp4BoxProber {
    pub fn new() -> Self {
        Self
    }
}

impl Prober for Mp4BoxProber {
    fn name(&self) -> &'static str {
        "mp4-boxes"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                matches!(
                    ext.to_ascii_lowercase().as_str(),
                    "mp4" | "m4v" | "mov" | "3gp"
                )
            })
            .unwrap_or(false)
    }

    fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let report = read_report(BufReader::new(file), size)?;
        debug!(
            path = %path.display(),
            duration_ms = report.duration_ms,
            tracks = report.tracks.len(),
            "parsed mp4 boxes"
        );
        Ok(report)
    }
}

struct BoxHeader {
    kind: [u8; 4],
    header_len: u64,
    /// Total box size including the header.
    size: u64,
}

fn read_header<R: Read>(reader: &mut R, remaining: u64) -> Result<Option<BoxHeader>> {
    if remaining < 8 {
        return Ok(None);
    }
    let mut head = [0u8; 8];
    match reader.read_exact(&mut head) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    }
    let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let kind = [head[4], head[5], head[6], head[7]];
    let (size, header_len) = match size32 {
        0 => (remaining, 8),
        1 => {
            let mut large = [0u8; 8];
            reader.read_exact(&mut large)?;
            (u64::from_be_bytes(large), 16)
        }
        n => (u64::from(n), 8),
    };
    if size < header_len || size > remaining {
        return Err(VidxError::Probe(format!(
            "box '{}' has invalid size {size}",
            fourcc(&kind)
        )));
    }
    Ok(Some(BoxHeader {
        kind,
        header_len,
        size,
    }))
}

fn read_report<R: Read + Seek>(mut reader: R, file_size: u64) -> Result<ProbeReport> {
    let mut brand = None;
    let mut moov = None;
    let mut offset = 0u64;

    while let Some(header) = read_header(&mut reader, file_size - offset)? {
        let payload_len = header.size - header.header_len;
        match &header.kind {
            b"ftyp" if payload_len >= 4 => {
                let mut major = [0u8; 4];
                reader.read_exact(&mut major)?;
                brand = Some(major);
            }
            b"moov" => {
                if payload_len > MAX_MOOV_BYTES {
                    return Err(VidxError::Probe(format!(
                        "moov box too large ({payload_len} bytes)"
                    )));
                }
                let mut payload = vec![0u8; payload_len as usize];
                reader.read_exact(&mut payload)?;
                moov = Some(payload);
            }
            _ => {}
        }
        offset += header.size;
        reader.seek(SeekFrom::Start(offset))?;
        if moov.is_some() && brand.is_some() {
            break;
        }
    }

    let moov = moov.ok_or_else(|| VidxError::Probe("no moov box".to_string()))?;
    let mut report = parse_moov(&moov)?;
    report.format = match brand.as_ref() {
        Some(b"qt  ") => "mov".to_string(),
        _ => "mp4".to_string(),
    };
    Ok(report)
}

/// Child boxes of an in-memory container payload as `(kind, payload)`.
fn children(data: &[u8]) -> Result<Vec<([u8; 4], &[u8])>> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while data.len() - pos >= 8 {
        let size32 = be_u32(data, pos)?;
        let kind = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let (size, header_len) = match size32 {
            0 => ((data.len() - pos) as u64, 8usize),
            1 => (be_u64(data, pos + 8)?, 16usize),
            n => (u64::from(n), 8usize),
        };
        let remaining = (data.len() - pos) as u64;
        if size < header_len as u64 || size > remaining {
            return Err(VidxError::Probe(format!(
                "box '{}' has invalid size {size}",
                fourcc(&kind)
            )));
        }
        let size = size as usize;
        boxes.push((kind, &data[pos + header_len..pos + size]));
        pos += size;
    }
    Ok(boxes)
}

fn child<'a>(data: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    Ok(children(data)?
        .into_iter()
        .find(|(k, _)| k == kind)
        .map(|(_, payload)| payload))
}

fn parse_moov(moov: &[u8]) -> Result<ProbeReport> {
    let mut report = ProbeReport::default();
    let mut timescale = 0u32;
    let mut duration = 0u64;
    let mut fragment_duration = None;

    for (kind, payload) in children(moov)? {
        match &kind {
            b"mvhd" => {
                let (ts, dur) = parse_mvhd(payload)?;
                timescale = ts;
                duration = dur;
            }
            b"mvex" => {
                report.fragmented = true;
                if let Some(mehd) = child(payload, b"mehd")? {
                    fragment_duration = Some(parse_mehd(mehd)?);
                }
            }
            b"trak" => {
                if let Some(track) = parse_trak(payload)? {
                    report.tracks.push(track);
                }
            }
            _ => {}
        }
    }

    if timescale == 0 {
        return Err(VidxError::Probe("movie header has no timescale".to_string()));
    }
    if duration == 0
        && let Some(fragment_duration) = fragment_duration
    {
        duration = fragment_duration;
    }
    report.duration_ms = duration.saturating_mul(1000) / u64::from(timescale);
    Ok(report)
}

/// `(timescale, duration)`
fn parse_mvhd(data: &[u8]) -> Result<(u32, u64)> {
    match version(data)? {
        1 => Ok((be_u32(data, 20)?, be_u64(data, 24)?)),
        _ => Ok((be_u32(data, 12)?, u64::from(be_u32(data, 16)?))),
    }
}

fn parse_mehd(data: &[u8]) -> Result<u64> {
    match version(data)? {
        1 => be_u64(data, 4),
        _ => Ok(u64::from(be_u32(data, 4)?)),
    }
}

/// `(width, height)` in whole pixels.
fn parse_tkhd(data: &[u8]) -> Result<(u32, u32)> {
    let base = match version(data)? {
        1 => 4 + 32 + 52,
        _ => 4 + 20 + 52,
    };
    Ok((
        be_u32(data, base)? / FIXED_16_16,
        be_u32(data, base + 4)? / FIXED_16_16,
    ))
}

fn parse_trak(trak: &[u8]) -> Result<Option<TrackInfo>> {
    let Some(tkhd) = child(trak, b"tkhd")? else {
        return Ok(None);
    };
    let (width, height) = parse_tkhd(tkhd)?;
    let Some(mdia) = child(trak, b"mdia")? else {
        return Ok(None);
    };

    let kind = match child(mdia, b"hdlr")? {
        Some(hdlr) => match slice(hdlr, 8, 4)? {
            b"vide" => TrackKind::Video,
            b"soun" => TrackKind::Audio,
            _ => TrackKind::Other,
        },
        None => TrackKind::Other,
    };

    let codec = child(mdia, b"minf")?
        .map(|minf| child(minf, b"stbl"))
        .transpose()?
        .flatten()
        .map(|stbl| child(stbl, b"stsd"))
        .transpose()?
        .flatten()
        .map(first_sample_entry)
        .transpose()?
        .flatten()
        .unwrap_or_default();

    Ok(Some(TrackInfo {
        kind,
        width,
        height,
        codec,
    }))
}

fn first_sample_entry(stsd: &[u8]) -> Result<Option<String>> {
    if be_u32(stsd, 4)? == 0 {
        return Ok(None);
    }
    let kind = slice(stsd, 12, 4)?;
    Ok(Some(fourcc(kind).trim_end().to_string()))
}

fn version(data: &[u8]) -> Result<u8> {
    data.first()
        .copied()
        .ok_or_else(|| VidxError::Probe("empty full box".to_string()))
}

fn slice(data: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    data.get(at..at + len).ok_or_else(|| {
        VidxError::Probe(format!("box truncated at offset {at}"))
    })
}

fn be_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes = slice(data, at, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn be_u64(data: &[u8], at: usize) -> Result<u64> {
    let bytes = slice(data, at, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

fn fourcc(kind: &[u8]) -> String {
    kind.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for synthetic MP4 box trees.

    pub fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    pub fn mvhd(timescale: u32, duration: u32) -> Vec<u8> {
        let mut p = vec![0u8; 100];
        p[12..16].copy_from_slice(&timescale.to_be_bytes());
        p[16..20].copy_from_slice(&duration.to_be_bytes());
        boxed(b"mvhd", &p)
    }

    pub fn tkhd(width: u32, height: u32) -> Vec<u8> {
        let mut p = vec![0u8; 84];
        p[76..80].copy_from_slice(&(width << 16).to_be_bytes());
        p[80..84].copy_from_slice(&(height << 16).to_be_bytes());
        boxed(b"tkhd", &p)
    }

    pub fn trak(handler: &[u8; 4], codec: &[u8; 4], width: u32, height: u32) -> Vec<u8> {
        let mut hdlr = vec![0u8; 24];
        hdlr[8..12].copy_from_slice(handler);
        let mut stsd = vec![0u8; 8];
        stsd[4..8].copy_from_slice(&1u32.to_be_bytes());
        stsd.extend(boxed(codec, &[0u8; 8]));
        let stbl = boxed(b"stbl", &boxed(b"stsd", &stsd));
        let minf = boxed(b"minf", &stbl);
        let mdia = boxed(b"mdia", &[boxed(b"hdlr", &hdlr), minf].concat());
        boxed(b"trak", &[tkhd(width, height), mdia].concat())
    }

    pub fn movie(fragmented: bool) -> Vec<u8> {
        let mut moov = mvhd(1000, 125_500);
        moov.extend(trak(b"vide", b"avc1", 1920, 1080));
        moov.extend(trak(b"soun", b"mp4a", 0, 0));
        if fragmented {
            moov.extend(boxed(b"mvex", &boxed(b"trex", &[0u8; 24])));
        }
        let mut file = boxed(b"ftyp", b"isom\0\0\x02\0isomiso2avc1mp41");
        file.extend(boxed(b"free", &[0u8; 16]));
        file.extend(boxed(b"mdat", &[0xABu8; 256]));
        file.extend(boxed(b"moov", &moov));
        file
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::io::Cursor;

    fn report(bytes: Vec<u8>) -> Result<ProbeReport> {
        let len = bytes.len() as u64;
        read_report(Cursor::new(bytes), len)
    }

    #[test]
    fn reads_duration_tracks_and_codecs() {
        let report = report(movie(false)).unwrap();
        assert_eq!(report.format, "mp4");
        assert_eq!(report.duration_ms, 125_500);
        assert!(!report.fragmented);

        let video = report.first_track(TrackKind::Video).unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert_eq!(video.codec, "avc1");
        assert_eq!(report.first_track(TrackKind::Audio).unwrap().codec, "mp4a");
    }

    #[test]
    fn movie_extends_box_marks_fragmented() {
        assert!(report(movie(true)).unwrap().fragmented);
    }

    #[test]
    fn fragment_duration_fills_empty_movie_duration() {
        let mut mehd = vec![0u8; 8];
        mehd[4..8].copy_from_slice(&90_000u32.to_be_bytes());
        let mut moov = mvhd(90_000, 0);
        moov.extend(boxed(b"mvex", &boxed(b"mehd", &mehd)));
        let file = boxed(b"moov", &moov);
        let report = report(file).unwrap();
        assert!(report.fragmented);
        assert_eq!(report.duration_ms, 1000);
    }

    #[test]
    fn quicktime_brand_reports_mov() {
        let mut file = boxed(b"ftyp", b"qt  \0\0\0\0");
        file.extend(boxed(b"moov", &mvhd(600, 600)));
        assert_eq!(report(file).unwrap().format, "mov");
    }

    #[test]
    fn missing_moov_is_probe_error() {
        let file = boxed(b"ftyp", b"isom\0\0\0\0");
        assert!(matches!(report(file), Err(VidxError::Probe(_))));
    }

    #[test]
    fn oversized_box_is_rejected() {
        let mut file = boxed(b"ftyp", b"isom\0\0\0\0");
        file.extend_from_slice(&1000u32.to_be_bytes());
        file.extend_from_slice(b"moov");
        assert!(matches!(report(file), Err(VidxError::Probe(_))));
    }
}
