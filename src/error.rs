use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MangaError {
    #[error("failed to download image after {attempts} attempts: {url} ({message})")]
    Fetch {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("download interrupted: {0}")]
    Interrupted(String),

    #[error("failed to download chapter: {chapter}")]
    Chapter {
        chapter: String,
        #[source]
        source: Box<MangaError>,
    },

    #[error("series {series} incomplete: {failed} of {total} chapters failed")]
    SeriesIncomplete {
        series: String,
        failed: usize,
        total: usize,
        #[source]
        first: Box<MangaError>,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("download tracker error: {0}")]
    Tracker(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("unsupported url: {0}")]
    Routing(String),

    #[error("catalog request failed: {0}")]
    Resolver(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),
}

impl MangaError {
    /// Wraps a failure that happened while working on one chapter.
    pub fn chapter(chapter: impl Into<String>, source: MangaError) -> Self {
        match source {
            already @ MangaError::Chapter { .. } => already,
            other => MangaError::Chapter {
                chapter: chapter.into(),
                source: Box::new(other),
            },
        }
    }
}
