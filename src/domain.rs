use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MangaError;

static INVALID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("valid regex"));
static UNDERSCORE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").expect("valid regex"));
static EDGE_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[._-]+|[._-]+$").expect("valid regex"));

/// Reduces a title to `[A-Za-z0-9_-]`, collapsing `_` runs and trimming edge punctuation.
pub fn sanitize(input: &str) -> String {
    let replaced = INVALID_CHARS.replace_all(input, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    EDGE_PUNCTUATION.replace_all(&collapsed, "").into_owned()
}

/// Series header shared by the series and every one of its chapters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesInfo {
    #[serde(default)]
    pub id: u32,
    pub url: String,
    pub title: String,
}

impl SeriesInfo {
    pub fn new(id: u32, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            title: title.into(),
        }
    }

    pub fn dir_name(&self) -> String {
        sanitize(&format!("{}_{}", self.id, self.title))
    }
}

#[derive(Debug, Clone)]
pub struct Series {
    info: Arc<SeriesInfo>,
    chapters: Vec<Chapter>,
}

impl Series {
    pub fn new(info: SeriesInfo) -> Self {
        Self {
            info: Arc::new(info),
            chapters: Vec::new(),
        }
    }

    /// Appends a chapter at the next index, pointing back at this series.
    pub fn add_chapter(
        &mut self,
        id: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
        image_urls: Vec<String>,
    ) -> &mut Chapter {
        let index = self.chapters.len() as u32 + 1;
        let chapter =
            Chapter::new(Arc::clone(&self.info), id, url, name, image_urls).with_index(index);
        self.chapters.push(chapter);
        let last = self.chapters.len() - 1;
        &mut self.chapters[last]
    }

    pub fn info(&self) -> &SeriesInfo {
        &self.info
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }
}

impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info
    }
}

impl Eq for Series {}

#[derive(Debug, Clone)]
pub struct Chapter {
    series: Arc<SeriesInfo>,
    pub id: String,
    pub url: String,
    pub name: String,
    pub index: u32,
    pub image_urls: Vec<String>,
    archive_path: OnceLock<Utf8PathBuf>,
}

impl Chapter {
    pub fn new(
        series: Arc<SeriesInfo>,
        id: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
        image_urls: Vec<String>,
    ) -> Self {
        Self {
            series,
            id: id.into(),
            url: url.into(),
            name: name.into(),
            index: 1,
            image_urls,
            archive_path: OnceLock::new(),
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn series(&self) -> &SeriesInfo {
        &self.series
    }

    pub fn dir_name(&self) -> String {
        sanitize(&format!("{}_{}", self.id, self.name))
    }

    pub fn archive_path(&self) -> Option<&Utf8Path> {
        self.archive_path.get().map(Utf8PathBuf::as_path)
    }

    /// Records the produced archive. Returns false if a path was already recorded.
    pub fn set_archive_path(&self, path: Utf8PathBuf) -> bool {
        self.archive_path.set(path).is_ok()
    }
}

impl PartialEq for Chapter {
    fn eq(&self, other: &Self) -> bool {
        self.series.url == other.series.url && self.url == other.url
    }
}

impl Eq for Chapter {}

impl Hash for Chapter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.series.url.hash(state);
        self.url.hash(state);
    }
}

impl fmt::Display for Chapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.series.title, self.name)
    }
}

/// Something the downloader can be pointed at.
#[derive(Debug, Clone)]
pub enum Entity {
    Series(Series),
    Chapter(Chapter),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Series(_) => EntityKind::Series,
            Entity::Chapter(_) => EntityKind::Chapter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Series,
    Chapter,
}

impl EntityKind {
    /// Decides from the URL path whether it names a series or a chapter.
    pub fn classify(url: &str) -> Result<Self, MangaError> {
        let without_query = url.split(['?', '#']).next().unwrap_or_default();
        let path = match without_query.split_once("://") {
            Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or(""),
            None => without_query,
        };
        let segments = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .map(str::to_ascii_lowercase)
            .collect::<Vec<_>>();

        if segments.iter().any(|segment| segment.starts_with("chapter")) {
            return Ok(EntityKind::Chapter);
        }
        let is_series = segments.iter().any(|segment| {
            ["series", "manga", "title"]
                .iter()
                .any(|prefix| segment.starts_with(prefix))
        });
        if is_series {
            return Ok(EntityKind::Series);
        }
        Err(MangaError::Routing(url.to_string()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Series => write!(f, "series"),
            EntityKind::Chapter => write!(f, "chapter"),
        }
    }
}
