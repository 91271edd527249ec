use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info};

use crate::archive;
use crate::catalog::CatalogResolver;
use crate::config::AppConfig;
use crate::convert::Converter;
use crate::domain::{Chapter, Entity, EntityKind, Series};
use crate::error::MangaError;
use crate::fetcher::{RetryingFetcher, Transport};
use crate::output::DownloadReport;
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::tracker::DownloadTracker;

/// Resolves a URL through the catalog and hands the result to the downloader.
pub struct App<R: CatalogResolver, T: Transport, C: Converter> {
    resolver: R,
    downloader: Downloader<T, C>,
}

impl<R: CatalogResolver, T: Transport, C: Converter> App<R, T, C> {
    pub fn new(resolver: R, downloader: Downloader<T, C>) -> Self {
        Self {
            resolver,
            downloader,
        }
    }

    pub fn downloader(&self) -> &Downloader<T, C> {
        &self.downloader
    }

    pub fn download_url(&self, url: &str) -> Result<DownloadReport, MangaError> {
        let kind = EntityKind::classify(url)?;
        let entity = match kind {
            EntityKind::Series => Entity::Series(self.resolver.resolve_series(url)?),
            EntityKind::Chapter => Entity::Chapter(self.resolver.resolve_chapter(url)?),
        };
        let path = self.downloader.download(&entity)?;
        Ok(DownloadReport {
            kind,
            url: url.to_string(),
            skipped: path.is_none(),
            path: path.map(|path| path.to_string()),
        })
    }
}

/// Two-level download scheduler: chapters on one pool, their images on another.
pub struct Downloader<T: Transport, C: Converter> {
    store: Store,
    tracker: Arc<DownloadTracker>,
    fetcher: Arc<RetryingFetcher<T>>,
    converter: C,
    chapter_pool: ThreadPool,
    image_pool: ThreadPool,
    shutdown: Arc<Shutdown>,
    convert_single_chapters: bool,
    track_single_chapters: bool,
}

impl<T: Transport, C: Converter> Downloader<T, C> {
    pub fn new(config: &AppConfig, transport: T, converter: C) -> Result<Self, MangaError> {
        let tracker = Arc::new(DownloadTracker::new(
            config.history_path(),
            config.skip_existing,
        ));
        Self::with_tracker(config, tracker, transport, converter)
    }

    pub fn with_tracker(
        config: &AppConfig,
        tracker: Arc<DownloadTracker>,
        transport: T,
        converter: C,
    ) -> Result<Self, MangaError> {
        config.validate()?;
        let shutdown = Arc::new(Shutdown::new());
        Ok(Self {
            store: Store::new(config.download_dir.clone()),
            tracker,
            fetcher: Arc::new(RetryingFetcher::new(
                transport,
                config.retry_policy(),
                Arc::clone(&shutdown),
            )),
            converter,
            chapter_pool: build_pool("chapter", config.chapter_workers)?,
            image_pool: build_pool("image", config.image_workers)?,
            shutdown,
            convert_single_chapters: config.convert,
            track_single_chapters: config.track_single_chapters,
        })
    }

    pub fn tracker(&self) -> &DownloadTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Downloads a series or a single chapter.
    ///
    /// Returns the series directory for a series, the archive path for a
    /// chapter, and `None` for a chapter that was already downloaded.
    pub fn download(&self, entity: &Entity) -> Result<Option<Utf8PathBuf>, MangaError> {
        match entity {
            Entity::Series(series) => self.download_series(series).map(Some),
            Entity::Chapter(chapter) => {
                if self.is_chapter_downloaded(chapter)? {
                    return Ok(None);
                }
                let series_dir = self.store.series_dir(chapter.series());
                Store::ensure_dir(&series_dir)?;
                debug!("Created series directory: {series_dir}");
                self.download_chapter(
                    chapter,
                    &series_dir,
                    self.convert_single_chapters,
                    self.track_single_chapters,
                )
                .map(Some)
            }
        }
    }

    /// Downloads every chapter of `series` that the tracker does not know yet.
    ///
    /// All dispatched chapters run to completion even when a sibling fails;
    /// finished chapters stay tracked and are still converted. Any failure is
    /// then reported as [`MangaError::SeriesIncomplete`]. A tracker failure is
    /// the exception: no further chapters start and the error is returned as is.
    pub fn download_series(&self, series: &Series) -> Result<Utf8PathBuf, MangaError> {
        let series_dir = self.store.series_dir(series.info());
        if self.tracker.is_series_downloaded(series)? {
            info!("Series already downloaded: {}", series.title());
            return Ok(series_dir);
        }

        info!(
            "Starting download of series: {} to {}",
            series.title(),
            self.store.download_root()
        );
        Store::ensure_dir(&series_dir)?;
        debug!("Created series directory: {series_dir}");

        let mut pending = Vec::new();
        for chapter in series.chapters() {
            if !self.is_chapter_downloaded(chapter)? {
                pending.push(chapter);
            }
        }

        let tracker_failed = AtomicBool::new(false);
        let results = self.chapter_pool.install(|| {
            pending
                .par_iter()
                .map(|chapter| {
                    if tracker_failed.load(Ordering::Acquire) {
                        return (*chapter, None);
                    }
                    let result = self.download_chapter(chapter, &series_dir, false, true);
                    if matches!(result, Err(MangaError::Tracker(_))) {
                        tracker_failed.store(true, Ordering::Release);
                    }
                    (*chapter, Some(result))
                })
                .collect::<Vec<_>>()
        });

        let mut packed = Vec::new();
        let mut failures = Vec::new();
        for (chapter, result) in results {
            match result {
                Some(Ok(path)) if archive::is_archive(&path) => packed.push(chapter),
                Some(Ok(_)) | None => {}
                Some(Err(err @ MangaError::Tracker(_))) => {
                    error!("Download history is unusable, stopping series {}", series.title());
                    return Err(err);
                }
                Some(Err(err)) => {
                    error!("Chapter {chapter} failed: {err}");
                    failures.push(err);
                }
            }
        }

        let conversion = self.converter.convert_all(&packed);
        if let Err(err) = &conversion {
            error!("Conversion failed for series {}: {err}", series.title());
        }

        let failed = failures.len();
        if let Some(first) = failures.into_iter().next() {
            return Err(MangaError::SeriesIncomplete {
                series: series.title().to_string(),
                failed,
                total: pending.len(),
                first: Box::new(first),
            });
        }
        conversion?;

        info!("Completed downloading series: {}", series.title());
        Ok(series_dir)
    }

    /// Fetches, packs and optionally tracks and converts one chapter.
    pub fn download_chapter(
        &self,
        chapter: &Chapter,
        parent: &Utf8Path,
        should_convert: bool,
        should_track: bool,
    ) -> Result<Utf8PathBuf, MangaError> {
        let _task = self.shutdown.begin("chapter")?;
        let chapter_dir = Store::chapter_dir(parent, chapter);
        info!("Downloading chapter: {} to {parent}", chapter.dir_name());

        let archive_path = self
            .fetch_and_pack(chapter, &chapter_dir)
            .map_err(|err| MangaError::chapter(chapter.to_string(), err))?;
        if !chapter.set_archive_path(archive_path.clone()) {
            debug!("Archive path for {chapter} was already recorded");
        }
        info!("Successfully downloaded chapter: {}", chapter.name);

        if should_track {
            self.tracker.mark_chapter_downloaded(chapter)?;
        }

        if should_convert {
            let converted = self.converter.convert_all(&[chapter])?;
            if let Some(path) = converted.into_iter().next() {
                return Ok(path);
            }
        }
        Ok(archive_path)
    }

    /// Stops admitting work and waits up to `timeout` for running tasks.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.drain(timeout)
    }

    fn fetch_and_pack(
        &self,
        chapter: &Chapter,
        chapter_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MangaError> {
        Store::ensure_dir(chapter_dir)?;
        debug!("Created chapter directory: {chapter_dir}");

        self.fetch_images(chapter, chapter_dir)?;

        let archive_path = archive::build_archive(chapter_dir)?;
        archive::cleanup_images(chapter_dir);
        Ok(archive_path)
    }

    /// Runs every image fetch of `chapter` on the image pool and blocks until all report back.
    ///
    /// The calling chapter worker waits on a channel rather than joining the
    /// pool, so it never picks up another chapter while its images are pending.
    fn fetch_images(&self, chapter: &Chapter, chapter_dir: &Utf8Path) -> Result<(), MangaError> {
        let total = chapter.image_urls.len();
        let (sender, receiver) = mpsc::channel();
        for (position, url) in chapter.image_urls.iter().enumerate() {
            let sender = sender.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let shutdown = Arc::clone(&self.shutdown);
            let url = url.clone();
            let destination = chapter_dir.to_path_buf();
            self.image_pool.spawn(move || {
                let result = shutdown
                    .begin("image")
                    .and_then(|_task| fetcher.fetch(&url, &destination, position + 1));
                let _ = sender.send((position, result));
            });
        }
        drop(sender);

        let mut received = 0;
        let mut first_failure: Option<(usize, MangaError)> = None;
        for (position, result) in receiver {
            received += 1;
            if let Err(err) = result {
                let earlier_failed = first_failure
                    .as_ref()
                    .is_some_and(|(earliest, _)| *earliest < position);
                if !earlier_failed {
                    first_failure = Some((position, err));
                }
            }
        }

        if let Some((_, err)) = first_failure {
            return Err(err);
        }
        if received < total {
            return Err(MangaError::Interrupted(format!(
                "{} of {total} image downloads did not report back",
                total - received
            )));
        }
        Ok(())
    }

    fn is_chapter_downloaded(&self, chapter: &Chapter) -> Result<bool, MangaError> {
        let downloaded = self.tracker.is_chapter_downloaded(chapter)?;
        if downloaded {
            info!("Chapter already downloaded: {}", chapter.name);
        }
        Ok(downloaded)
    }
}

fn build_pool(kind: &'static str, threads: usize) -> Result<ThreadPool, MangaError> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{kind}-worker-{i}"))
        .build()
        .map_err(|err| MangaError::InvalidConfig(format!("{kind} pool: {err}")))
}
