use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

/// A sibling of `path` that keeps its extension, so tools inferring the
/// output format from the name still work: `a/b.jpg` -> `a/b.tmp-<id>.jpg`.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id = Uuid::new_v4().simple();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.tmp-{id}.{}", ext.to_string_lossy()),
        None => format!("{stem}.tmp-{id}"),
    };
    path.with_file_name(name)
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Produce `target` through `produce`, which writes to a temporary sibling.
/// The target only appears once `produce` succeeds.
pub(crate) fn write_via_temp<F>(target: &Path, produce: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    ensure_parent(target)?;
    let tmp = temp_sibling(target);
    match produce(&tmp) {
        Ok(()) => {
            if let Err(err) = fs::rename(&tmp, target) {
                discard(&tmp);
                return Err(err.into());
            }
            Ok(())
        }
        Err(err) => {
            discard(&tmp);
            Err(err)
        }
    }
}

/// Write `contents` to `target` atomically.
pub(crate) fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    write_via_temp(target, |tmp| {
        let mut file = fs::File::create(tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        Ok(())
    })
}

fn discard(path: &Path) {
    if path.exists()
        && let Err(err) = fs::remove_file(path)
    {
        warn!(path = %path.display(), "failed to remove temporary file: {err}");
    }
}

/// Transient directory removed on drop. Removal failures are logged only.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) fn create(parent: &Path, label: &str) -> Result<Self> {
        let path = parent.join(format!("{label}-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(
                path = %self.path.display(),
                "failed to remove scratch directory: {err}"
            );
        }
    }
}
