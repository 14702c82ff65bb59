//! Library discovery.
//!
//! [`VideoScanner::files`] yields a flat, lazily walked sequence of video
//! paths. [`VideoScanner::scan_tree`] mirrors the directory structure into
//! spaces (top-level directories) holding nested groups.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, VidxError};

/// Name of the implicit group holding files that sit directly in a space.
pub const ROOT_GROUP: &str = "root";

/// Synthetic space collecting video files that sit directly in the library root.
pub const LOOSE_FILES_SPACE: &str = "_root";

pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "mov", "avi", "webm", "wmv", "flv", "mpg", "mpeg",
    "ts", "m2ts", "mts", "3gp", "ogv",
];

pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "thumbnails",
    "previews",
    "preview_thumbnails",
    "video_markers",
    "@eaDir",
    "lost+found",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerOptions {
    /// Lowercase extensions without the leading dot.
    pub video_extensions: Vec<String>,
    /// Directory names that hold internal metadata and are never descended.
    pub excluded_dirs: Vec<String>,
    pub follow_links: bool,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self {
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

/// A top-level directory of the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub name: String,
    pub path: PathBuf,
    /// The implicit [`ROOT_GROUP`] comes first, then one group per
    /// subdirectory in name order.
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
    pub groups: Vec<Group>,
}

impl Group {
    fn empty(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
            files: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
            + self.groups.iter().map(Group::file_count).sum::<usize>()
    }
}

impl Space {
    pub fn file_count(&self) -> usize {
        self.groups.iter().map(Group::file_count).sum()
    }

    pub fn root_group(&self) -> Option<&Group> {
        self.groups.first().filter(|group| group.name == ROOT_GROUP)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VideoScanner {
    options: ScannerOptions,
}

impl VideoScanner {
    pub fn new(options: ScannerOptions) -> Self {
        let mut options = options;
        for ext in &mut options.video_extensions {
            *ext = ext.trim_start_matches('.').to_lowercase();
        }
        Self { options }
    }

    pub fn options(&self) -> &ScannerOptions {
        &self.options
    }

    pub fn is_video_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.options.video_extensions.iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }

    fn is_skipped_name(&self, name: &OsStr) -> bool {
        let Some(name) = name.to_str() else {
            return false;
        };
        name.starts_with('.')
            || self.options.excluded_dirs.iter().any(|dir| dir == name)
    }

    fn check_root(root: &Path) -> Result<()> {
        if !root.exists() {
            return Err(VidxError::NotFound(format!(
                "Directory does not exist: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(VidxError::Validation(format!(
                "Path is not a directory: {}",
                root.display()
            )));
        }
        Ok(())
    }

    /// Walk `root` and yield every video file beneath it.
    ///
    /// The walk is lazy; calling this again starts a fresh traversal.
    pub fn files<'a>(
        &'a self,
        root: &Path,
    ) -> Result<impl Iterator<Item = PathBuf> + 'a> {
        Self::check_root(root)?;
        let root = fs::canonicalize(root)?;
        info!(root = %root.display(), "scanning library");

        let walker = WalkDir::new(&root)
            .follow_links(self.options.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                entry.depth() == 0 || !self.is_skipped_name(entry.file_name())
            });

        Ok(walker.filter_map(move |entry| match entry {
            Ok(entry) => self.accept(&entry),
            Err(err) => {
                warn!("skipping unreadable entry: {err}");
                None
            }
        }))
    }

    fn accept(&self, entry: &DirEntry) -> Option<PathBuf> {
        if !entry.file_type().is_file() && !entry.path().is_file() {
            return None;
        }
        if self.is_video_file(entry.path()) {
            debug!(path = %entry.path().display(), "found video file");
            Some(entry.path().to_path_buf())
        } else {
            None
        }
    }

    /// Mirror the library into spaces and nested groups.
    pub fn scan_tree(&self, root: &Path) -> Result<Vec<Space>> {
        Self::check_root(root)?;
        let root = fs::canonicalize(root)?;
        let mut visited = HashSet::new();
        let mut spaces = Vec::new();
        let mut loose = Vec::new();

        for path in self.sorted_entries(&root) {
            if path.is_dir() {
                mark_visited(&mut visited, &path);
                let name = display_name(&path);
                let mut root_group = Group::empty(ROOT_GROUP, path.clone());
                let mut groups = Vec::new();
                self.fill_group(
                    &path,
                    &mut root_group.files,
                    &mut groups,
                    &mut visited,
                );
                let mut all = vec![root_group];
                all.extend(groups);
                spaces.push(Space {
                    name,
                    path,
                    groups: all,
                });
            } else if path.is_file()
                && self.is_video_file(&path)
                && mark_visited(&mut visited, &path)
            {
                loose.push(path);
            }
        }

        if !loose.is_empty() {
            let mut root_group = Group::empty(ROOT_GROUP, root.clone());
            root_group.files = loose;
            spaces.push(Space {
                name: LOOSE_FILES_SPACE.to_string(),
                path: root.clone(),
                groups: vec![root_group],
            });
        }

        info!(
            root = %root.display(),
            spaces = spaces.len(),
            files = spaces.iter().map(Space::file_count).sum::<usize>(),
            "library tree scanned"
        );
        Ok(spaces)
    }

    fn fill_group(
        &self,
        dir: &Path,
        files: &mut Vec<PathBuf>,
        groups: &mut Vec<Group>,
        visited: &mut HashSet<PathBuf>,
    ) {
        for path in self.sorted_entries(dir) {
            if path.is_dir() {
                if !self.options.follow_links && is_symlink(&path) {
                    continue;
                }
                if !mark_visited(visited, &path) {
                    continue;
                }
                let mut group = Group::empty(display_name(&path), path.clone());
                self.fill_group(&path, &mut group.files, &mut group.groups, visited);
                groups.push(group);
            } else if path.is_file()
                && self.is_video_file(&path)
                && mark_visited(visited, &path)
            {
                files.push(path);
            }
        }
    }

    /// Non-hidden, non-excluded children of `dir` in name order. Unreadable
    /// directories produce no entries.
    fn sorted_entries(&self, dir: &Path) -> Vec<PathBuf> {
        let reader = match fs::read_dir(dir) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(dir = %dir.display(), "skipping unreadable directory: {err}");
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = reader
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(dir = %dir.display(), "skipping unreadable entry: {err}");
                    None
                }
            })
            .filter(|entry| !self.is_skipped_name(&entry.file_name()))
            .map(|entry| entry.path())
            .collect();
        paths.sort();
        paths
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Record `path` as seen; false when it was already reached through another
/// branch of the traversal.
fn mark_visited(visited: &mut HashSet<PathBuf>, path: &Path) -> bool {
    let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    visited.insert(key)
}
