use std::fs;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::domain::{Chapter, Series, SeriesInfo};
use crate::error::MangaError;

/// Turns catalog URLs into series and chapters. Failures are terminal for the entity.
pub trait CatalogResolver: Send + Sync {
    fn resolve_series(&self, url: &str) -> Result<Series, MangaError>;
    fn resolve_chapter(&self, url: &str) -> Result<Chapter, MangaError>;
}

#[derive(Debug, Deserialize)]
pub struct SeriesManifest {
    #[serde(default)]
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<ChapterManifest>,
}

#[derive(Debug, Deserialize)]
pub struct ChapterManifest {
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub series: Option<SeriesInfo>,
}

impl SeriesManifest {
    pub fn into_series(self, url: &str) -> Series {
        let mut series = Series::new(SeriesInfo::new(self.id, url, self.title));
        for chapter in self.chapters {
            let added = series.add_chapter(chapter.id, chapter.url, chapter.name, chapter.images);
            if let Some(index) = chapter.index {
                added.index = index;
            }
        }
        series
    }
}

impl ChapterManifest {
    pub fn into_chapter(self) -> Result<Chapter, MangaError> {
        let series = self.series.ok_or_else(|| {
            MangaError::Resolver(format!("chapter manifest {} has no series", self.url))
        })?;
        Ok(
            Chapter::new(Arc::new(series), self.id, self.url, self.name, self.images)
                .with_index(self.index.unwrap_or(1)),
        )
    }
}

/// Reads JSON manifests from http(s) URLs, `file://` URLs or plain paths.
#[derive(Clone)]
pub struct ManifestResolver {
    client: Client,
}

impl ManifestResolver {
    pub fn new(user_agent: &str) -> Result<Self, MangaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|err| MangaError::InvalidConfig(format!("user agent: {err}")))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| MangaError::Resolver(err.to_string()))?;
        Ok(Self { client })
    }

    fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T, MangaError> {
        let body = if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|err| MangaError::Resolver(err.to_string()))?;
            if !response.status().is_success() {
                return Err(MangaError::Resolver(format!(
                    "{url} returned status {}",
                    response.status().as_u16()
                )));
            }
            response
                .text()
                .map_err(|err| MangaError::Resolver(err.to_string()))?
        } else {
            let path = url.strip_prefix("file://").unwrap_or(url);
            fs::read_to_string(path)
                .map_err(|err| MangaError::Resolver(format!("read {path}: {err}")))?
        };
        serde_json::from_str(&body)
            .map_err(|err| MangaError::Resolver(format!("invalid manifest at {url}: {err}")))
    }
}

impl CatalogResolver for ManifestResolver {
    fn resolve_series(&self, url: &str) -> Result<Series, MangaError> {
        let manifest: SeriesManifest = self.fetch(url)?;
        Ok(manifest.into_series(url))
    }

    fn resolve_chapter(&self, url: &str) -> Result<Chapter, MangaError> {
        let manifest: ChapterManifest = self.fetch(url)?;
        manifest.into_chapter()
    }
}
