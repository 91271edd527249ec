use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Chapter, Series};
use crate::error::MangaError;
use crate::store::Store;

/// Contents of the history file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    #[serde(default)]
    pub series: BTreeMap<String, SeriesRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub title: String,
    #[serde(default)]
    pub chapters: BTreeMap<String, ChapterRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    pub name: String,
    pub completed: bool,
    pub downloaded_at: String,
}

impl DownloadRecord {
    fn is_completed(&self, series_url: &str, chapter_url: &str) -> bool {
        self.series
            .get(series_url)
            .and_then(|entry| entry.chapters.get(chapter_url))
            .map(|chapter| chapter.completed)
            .unwrap_or(false)
    }
}

/// Durable ledger of finished chapters, shared by all chapter tasks.
///
/// The record is read from disk on first use and rewritten in full after every
/// mutation. Every operation holds the same lock for its whole duration.
#[derive(Debug)]
pub struct DownloadTracker {
    path: Utf8PathBuf,
    skip_existing: bool,
    record: Mutex<Option<DownloadRecord>>,
}

impl DownloadTracker {
    pub fn new(path: Utf8PathBuf, skip_existing: bool) -> Self {
        Self {
            path,
            skip_existing,
            record: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_chapter_downloaded(&self, chapter: &Chapter) -> Result<bool, MangaError> {
        if !self.skip_existing {
            return Ok(false);
        }
        self.with_record(|record| Ok(record.is_completed(&chapter.series().url, &chapter.url)))
    }

    pub fn is_series_downloaded(&self, series: &Series) -> Result<bool, MangaError> {
        if !self.skip_existing {
            return Ok(false);
        }
        self.with_record(|record| {
            let Some(entry) = record.series.get(series.url()) else {
                return Ok(false);
            };
            if entry.chapters.is_empty() {
                return Ok(false);
            }
            Ok(series
                .chapters()
                .iter()
                .all(|chapter| record.is_completed(series.url(), &chapter.url)))
        })
    }

    pub fn mark_chapter_downloaded(&self, chapter: &Chapter) -> Result<(), MangaError> {
        self.with_record(|record| {
            let series = chapter.series();
            let entry = record
                .series
                .entry(series.url.clone())
                .or_insert_with(|| SeriesRecord {
                    title: series.title.clone(),
                    chapters: BTreeMap::new(),
                });
            entry.chapters.insert(
                chapter.url.clone(),
                ChapterRecord {
                    name: chapter.name.clone(),
                    completed: true,
                    downloaded_at: chrono::Utc::now().to_rfc3339(),
                },
            );
            self.save(record)
        })?;
        debug!("Marked chapter downloaded: {}", chapter.name);
        Ok(())
    }

    /// Copy of the current record, loading it if needed.
    pub fn snapshot(&self) -> Result<DownloadRecord, MangaError> {
        self.with_record(|record| Ok(record.clone()))
    }

    fn with_record<T>(
        &self,
        f: impl FnOnce(&mut DownloadRecord) -> Result<T, MangaError>,
    ) -> Result<T, MangaError> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| MangaError::Tracker("tracker lock poisoned".to_string()))?;
        let loaded = match guard.take() {
            Some(record) => record,
            None => self.load()?,
        };
        f(guard.insert(loaded))
    }

    fn load(&self) -> Result<DownloadRecord, MangaError> {
        if !self.path.exists() {
            debug!("No history file at {}, starting empty", self.path);
            return Ok(DownloadRecord::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|err| MangaError::Tracker(format!("failed to load {}: {err}", self.path)))?;
        serde_json::from_str(&content)
            .map_err(|err| MangaError::Tracker(format!("failed to parse {}: {err}", self.path)))
    }

    fn save(&self, record: &DownloadRecord) -> Result<(), MangaError> {
        let content = serde_json::to_vec_pretty(record)
            .map_err(|err| MangaError::Tracker(format!("failed to encode history: {err}")))?;
        Store::write_bytes_atomic(&self.path, &content).map_err(|err| {
            MangaError::Tracker(format!("failed to save download tracker: {err}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::SeriesInfo;

    fn series_with(chapters: usize) -> Series {
        let mut series = Series::new(SeriesInfo::new(3, "https://x/series/3", "Three"));
        for i in 1..=chapters {
            series.add_chapter(
                i.to_string(),
                format!("https://x/chapter/{i}"),
                format!("Chapter {i}"),
                vec![],
            );
        }
        series
    }

    fn tracker_in(dir: &tempfile::TempDir, skip_existing: bool) -> DownloadTracker {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        DownloadTracker::new(root.join("history.json"), skip_existing)
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, true);
        let series = series_with(1);
        assert!(!tracker.is_chapter_downloaded(&series.chapters()[0]).unwrap());
        assert!(!tracker.is_series_downloaded(&series).unwrap());
        assert_eq!(tracker.snapshot().unwrap(), DownloadRecord::default());
    }

    #[test]
    fn skip_disabled_never_reports_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, false);
        let series = series_with(1);
        tracker.mark_chapter_downloaded(&series.chapters()[0]).unwrap();
        assert!(!tracker.is_chapter_downloaded(&series.chapters()[0]).unwrap());
        assert!(!tracker.is_series_downloaded(&series).unwrap());
        assert!(tracker.path().exists());
    }

    #[test]
    fn corrupt_file_is_tracker_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, true);
        fs::write(tracker.path(), b"{ not json").unwrap();
        let series = series_with(1);
        let err = tracker.is_chapter_downloaded(&series.chapters()[0]).unwrap_err();
        assert_matches!(err, MangaError::Tracker(_));
    }

    #[test]
    fn persisted_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir, true);
        let series = series_with(1);
        tracker.mark_chapter_downloaded(&series.chapters()[0]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tracker.path()).unwrap()).unwrap();
        let entry = &raw["series"]["https://x/series/3"];
        assert_eq!(entry["title"], "Three");
        let chapter = &entry["chapters"]["https://x/chapter/1"];
        assert_eq!(chapter["name"], "Chapter 1");
        assert_eq!(chapter["completed"], true);
        let stamp = chapter["downloadedAt"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
