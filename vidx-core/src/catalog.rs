//! Persistence contract for indexed videos.
//!
//! Everything is keyed by identity. Writes happen inside a [`CatalogTx`]
//! unit of work that holds the catalog lock from the first read to commit;
//! a transaction dropped without [`CatalogTx::commit`] is rolled back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VidxError};
use crate::identity::Fingerprint;
use crate::markers::Marker;
use crate::probe::CodecRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub size: u64,
    pub codec: CodecRecord,
    pub indexed_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn new(
        fingerprint: Fingerprint,
        path: impl Into<PathBuf>,
        size: u64,
        codec: CodecRecord,
    ) -> Self {
        Self {
            fingerprint,
            path: path.into(),
            size,
            codec,
            indexed_at: Utc::now(),
        }
    }
}

pub trait CatalogTx {
    fn get_video(&self, fingerprint: &Fingerprint) -> Result<VideoRecord>;

    /// Fails with `AlreadyExists` when the identity is already recorded.
    fn insert_video(&mut self, record: VideoRecord) -> Result<()>;

    /// Removes the record together with its path entry and markers.
    fn remove_video(&mut self, fingerprint: &Fingerprint) -> Result<VideoRecord>;

    fn list_videos(&self) -> Result<Vec<VideoRecord>>;

    fn get_path(&self, fingerprint: &Fingerprint) -> Result<PathBuf>;

    /// Fails with `AlreadyExists` when the identity already has a path.
    fn insert_path(&mut self, fingerprint: &Fingerprint, path: &Path) -> Result<()>;

    /// Empty when nothing was stored.
    fn get_markers(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>>;

    fn replace_markers(
        &mut self,
        fingerprint: &Fingerprint,
        markers: Vec<Marker>,
    ) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait Catalog: Send + Sync {
    fn begin(&self) -> Result<Box<dyn CatalogTx + '_>>;

    fn insert_video(&self, record: VideoRecord) -> Result<()> {
        transaction(self, |tx| tx.insert_video(record))
    }

    fn get_video(&self, fingerprint: &Fingerprint) -> Result<VideoRecord> {
        transaction(self, |tx| tx.get_video(fingerprint))
    }

    fn remove_video(&self, fingerprint: &Fingerprint) -> Result<VideoRecord> {
        transaction(self, |tx| tx.remove_video(fingerprint))
    }

    fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        transaction(self, |tx| tx.list_videos())
    }

    fn insert_path(&self, fingerprint: &Fingerprint, path: &Path) -> Result<()> {
        transaction(self, |tx| tx.insert_path(fingerprint, path))
    }

    fn get_path(&self, fingerprint: &Fingerprint) -> Result<PathBuf> {
        transaction(self, |tx| tx.get_path(fingerprint))
    }

    fn get_markers(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>> {
        transaction(self, |tx| tx.get_markers(fingerprint))
    }

    fn replace_markers(
        &self,
        fingerprint: &Fingerprint,
        markers: Vec<Marker>,
    ) -> Result<()> {
        transaction(self, |tx| tx.replace_markers(fingerprint, markers))
    }
}

/// Run `work` as one unit of work: committed when it returns `Ok`, rolled
/// back otherwise.
pub fn transaction<C, T, F>(catalog: &C, work: F) -> Result<T>
where
    C: Catalog + ?Sized,
    F: FnOnce(&mut dyn CatalogTx) -> Result<T>,
{
    let mut tx = catalog.begin()?;
    let value = work(tx.as_mut())?;
    tx.commit()?;
    Ok(value)
}

#[derive(Debug, Default)]
struct Collections {
    videos: HashMap<Fingerprint, VideoRecord>,
    paths: HashMap<Fingerprint, PathBuf>,
    markers: HashMap<Fingerprint, Vec<Marker>>,
}

/// In-process catalog behind a single coarse lock.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    collections: Mutex<Collections>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemoryCatalog {
    fn begin(&self) -> Result<Box<dyn CatalogTx + '_>> {
        Ok(Box::new(MemoryTx {
            collections: self.collections.lock(),
            undo: Vec::new(),
            committed: false,
        }))
    }
}

enum Undo {
    Video(Fingerprint, Option<VideoRecord>),
    Path(Fingerprint, Option<PathBuf>),
    Markers(Fingerprint, Option<Vec<Marker>>),
}

struct MemoryTx<'a> {
    collections: MutexGuard<'a, Collections>,
    undo: Vec<Undo>,
    committed: bool,
}

fn restore<V>(map: &mut HashMap<Fingerprint, V>, key: Fingerprint, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Drop for MemoryTx<'_> {
    fn drop(&mut self) {
        if self.committed || self.undo.is_empty() {
            return;
        }
        debug!(changes = self.undo.len(), "rolling back catalog transaction");
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Video(key, previous) => {
                    restore(&mut self.collections.videos, key, previous)
                }
                Undo::Path(key, previous) => {
                    restore(&mut self.collections.paths, key, previous)
                }
                Undo::Markers(key, previous) => {
                    restore(&mut self.collections.markers, key, previous)
                }
            }
        }
    }
}

impl CatalogTx for MemoryTx<'_> {
    fn get_video(&self, fingerprint: &Fingerprint) -> Result<VideoRecord> {
        self.collections
            .videos
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| VidxError::NotFound(format!("video {fingerprint}")))
    }

    fn insert_video(&mut self, record: VideoRecord) -> Result<()> {
        let key = record.fingerprint.clone();
        if self.collections.videos.contains_key(&key) {
            return Err(VidxError::AlreadyExists(format!("video {key}")));
        }
        self.collections.videos.insert(key.clone(), record);
        self.undo.push(Undo::Video(key, None));
        Ok(())
    }

    fn remove_video(&mut self, fingerprint: &Fingerprint) -> Result<VideoRecord> {
        let record = self
            .collections
            .videos
            .remove(fingerprint)
            .ok_or_else(|| VidxError::NotFound(format!("video {fingerprint}")))?;
        self.undo
            .push(Undo::Video(fingerprint.clone(), Some(record.clone())));
        let path = self.collections.paths.remove(fingerprint);
        self.undo.push(Undo::Path(fingerprint.clone(), path));
        let markers = self.collections.markers.remove(fingerprint);
        self.undo.push(Undo::Markers(fingerprint.clone(), markers));
        Ok(record)
    }

    fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        let mut videos: Vec<VideoRecord> =
            self.collections.videos.values().cloned().collect();
        videos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(videos)
    }

    fn get_path(&self, fingerprint: &Fingerprint) -> Result<PathBuf> {
        self.collections
            .paths
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| VidxError::NotFound(format!("path for {fingerprint}")))
    }

    fn insert_path(&mut self, fingerprint: &Fingerprint, path: &Path) -> Result<()> {
        if self.collections.paths.contains_key(fingerprint) {
            return Err(VidxError::AlreadyExists(format!("path for {fingerprint}")));
        }
        self.collections
            .paths
            .insert(fingerprint.clone(), path.to_path_buf());
        self.undo.push(Undo::Path(fingerprint.clone(), None));
        Ok(())
    }

    fn get_markers(&self, fingerprint: &Fingerprint) -> Result<Vec<Marker>> {
        Ok(self
            .collections
            .markers
            .get(fingerprint)
            .cloned()
            .unwrap_or_default())
    }

    fn replace_markers(
        &mut self,
        fingerprint: &Fingerprint,
        markers: Vec<Marker>,
    ) -> Result<()> {
        let previous = self
            .collections
            .markers
            .insert(fingerprint.clone(), markers);
        self.undo.push(Undo::Markers(fingerprint.clone(), previous));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fp(byte: &str) -> Fingerprint {
        byte.repeat(32).parse().unwrap()
    }

    fn record(key: &str) -> VideoRecord {
        VideoRecord::new(
            fp(key),
            format!("/videos/{key}.mp4"),
            42,
            CodecRecord::default(),
        )
    }

    #[test]
    fn insert_is_unique_per_identity() {
        let catalog = MemoryCatalog::new();
        catalog.insert_video(record("aa")).unwrap();
        let err = catalog.insert_video(record("aa")).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(catalog.get_video(&fp("aa")).unwrap().size, 42);
        assert!(catalog.get_video(&fp("bb")).unwrap_err().is_not_found());
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let catalog = MemoryCatalog::new();
        catalog.insert_path(&fp("bb"), Path::new("/old.mp4")).unwrap();

        let result = transaction(&catalog, |tx| {
            tx.insert_video(record("bb"))?;
            tx.insert_path(&fp("bb"), Path::new("/new.mp4"))
        });
        assert!(result.unwrap_err().is_already_exists());
        assert!(catalog.get_video(&fp("bb")).unwrap_err().is_not_found());
        assert_eq!(catalog.get_path(&fp("bb")).unwrap(), PathBuf::from("/old.mp4"));
    }

    #[test]
    fn remove_clears_related_entries() {
        let catalog = MemoryCatalog::new();
        transaction(&catalog, |tx| {
            tx.insert_video(record("cc"))?;
            tx.insert_path(&fp("cc"), Path::new("/videos/cc.mp4"))?;
            tx.replace_markers(&fp("cc"), vec![Marker::new(0, 0, 5, "x").unwrap()])
        })
        .unwrap();

        catalog.remove_video(&fp("cc")).unwrap();
        assert!(catalog.get_path(&fp("cc")).unwrap_err().is_not_found());
        assert!(catalog.get_markers(&fp("cc")).unwrap().is_empty());
        assert!(catalog.remove_video(&fp("cc")).unwrap_err().is_not_found());
    }

    #[test]
    fn concurrent_inserts_admit_one_winner() {
        let catalog = Arc::new(MemoryCatalog::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || catalog.insert_video(record("dd")).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
