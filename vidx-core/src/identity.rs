//! Content-derived video identity.
//!
//! A fingerprint hashes the first and last [`CHUNK_SIZE`] bytes of a file.
//! Files up to twice the chunk size are hashed in full. Bytes strictly
//! between the head and tail chunks of larger files never reach the hasher,
//! so two files that differ only in that middle region share an identity.
//! Previously indexed libraries depend on this exact byte selection.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, VidxError};

/// 5 MiB.
pub const CHUNK_SIZE: u64 = 5 * 1024 * 1024;

const READ_BUFFER: usize = 64 * 1024;

/// Lowercase hex SHA-256 digest identifying a video by content.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const HEX_LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used for content-addressed directory fanout.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    pub fn is_valid(raw: &str) -> bool {
        raw.len() == Self::HEX_LEN
            && raw
                .as_bytes()
                .iter()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = VidxError;

    fn from_str(s: &str) -> Result<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(VidxError::Validation(format!("invalid fingerprint: {s}")))
        }
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = VidxError;

    fn try_from(value: String) -> Result<Self> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(VidxError::Validation(format!("invalid fingerprint: {value}")))
        }
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute the identity of the file at `path`.
pub fn fingerprint_file<P: AsRef<Path>>(path: P) -> Result<Fingerprint> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let fingerprint = fingerprint_reader(&mut file, size)?;
    debug!(path = %path.display(), size, %fingerprint, "computed fingerprint");
    Ok(fingerprint)
}

/// Compute the identity of `size` bytes readable from `reader`, which must be
/// positioned at the start of the content.
pub fn fingerprint_reader<R: Read + Seek>(
    reader: &mut R,
    size: u64,
) -> Result<Fingerprint> {
    let mut hasher = Sha256::new();

    copy_into(&mut hasher, reader.by_ref().take(CHUNK_SIZE))?;

    if size > 2 * CHUNK_SIZE {
        reader.seek(SeekFrom::Start(size - CHUNK_SIZE))?;
        copy_into(&mut hasher, reader.by_ref().take(CHUNK_SIZE))?;
    } else if size > CHUNK_SIZE {
        copy_into(&mut hasher, reader.by_ref())?;
    }

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

fn copy_into<R: Read>(hasher: &mut Sha256, mut reader: R) -> Result<u64> {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}
