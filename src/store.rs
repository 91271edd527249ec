use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{Chapter, SeriesInfo};
use crate::error::MangaError;

/// On-disk layout: `<root>/<series>/<chapter>/<chapter>.cbz`.
#[derive(Debug, Clone)]
pub struct Store {
    download_root: Utf8PathBuf,
}

impl Store {
    pub fn new(download_root: Utf8PathBuf) -> Self {
        Self { download_root }
    }

    pub fn download_root(&self) -> &Utf8Path {
        &self.download_root
    }

    pub fn series_dir(&self, series: &SeriesInfo) -> Utf8PathBuf {
        self.download_root.join(series.dir_name())
    }

    pub fn chapter_dir(parent: &Utf8Path, chapter: &Chapter) -> Utf8PathBuf {
        parent.join(chapter.dir_name())
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), MangaError> {
        fs::create_dir_all(path).map_err(|err| {
            MangaError::Filesystem(format!("failed to create directory {path}: {err}"))
        })
    }

    /// Writes `content` next to `path` and renames it into place.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), MangaError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            Self::ensure_dir(parent)?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(&tmp_path, content).map_err(|err| {
            MangaError::Filesystem(format!("failed to write {tmp_path}: {err}"))
        })?;
        fs::rename(&tmp_path, path)
            .map_err(|err| MangaError::Filesystem(format!("failed to replace {path}: {err}")))?;
        Ok(())
    }
}
