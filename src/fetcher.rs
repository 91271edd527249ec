use std::fs::File;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::domain::sanitize;
use crate::error::MangaError;
use crate::shutdown::Shutdown;

/// Single network attempt: fetch `url` and write the body to `destination`.
pub trait Transport: Send + Sync + 'static {
    fn fetch_to(&self, url: &str, destination: &Utf8Path) -> Result<(), TransferError>;
}

/// Why one attempt failed. Every variant is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Status(u16),
    Transport(String),
    Io(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Status(code) => write!(f, "status code {code}"),
            TransferError::Transport(message) => write!(f, "transport error: {message}"),
            TransferError::Io(message) => write!(f, "write error: {message}"),
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, MangaError> {
        Self::with_timeout(user_agent, DEFAULT_REQUEST_TIMEOUT)
    }

    /// `request_timeout` bounds a whole transfer, body included.
    pub fn with_timeout(user_agent: &str, request_timeout: Duration) -> Result<Self, MangaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|err| MangaError::InvalidConfig(format!("user agent: {err}")))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(request_timeout)
            .build()
            .map_err(|err| MangaError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn fetch_to(&self, url: &str, destination: &Utf8Path) -> Result<(), TransferError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TransferError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransferError::Status(response.status().as_u16()));
        }
        let mut file = File::create(destination).map_err(|err| TransferError::Io(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| TransferError::Io(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

pub struct RetryingFetcher<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    shutdown: Arc<Shutdown>,
}

impl<T: Transport> RetryingFetcher<T> {
    pub fn new(transport: T, policy: RetryPolicy, shutdown: Arc<Shutdown>) -> Self {
        Self {
            transport,
            policy,
            shutdown,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Downloads image number `index` of a chapter into `destination_dir`.
    pub fn fetch(
        &self,
        url: &str,
        destination_dir: &Utf8Path,
        index: usize,
    ) -> Result<Utf8PathBuf, MangaError> {
        let image_path = destination_dir.join(image_file_name(url, index));
        debug!("Downloading image: {url} to {image_path}");

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let failure = match self.transport.fetch_to(url, &image_path) {
                Ok(()) => {
                    debug!("Successfully downloaded image: {url}");
                    return Ok(image_path);
                }
                Err(failure) => failure,
            };
            warn!("Failed to download image (attempt {attempt}/{attempts}): {url} ({failure})");
            if attempt >= attempts {
                return Err(MangaError::Fetch {
                    url: url.to_string(),
                    attempts: attempt,
                    message: failure.to_string(),
                });
            }
            if let Err(interrupted) = self.shutdown.sleep(self.policy.delay) {
                return Err(MangaError::Fetch {
                    url: url.to_string(),
                    attempts: attempt,
                    message: interrupted.to_string(),
                });
            }
            attempt += 1;
        }
    }
}

/// `007.png` for the seventh image of `https://host/a/b.png?x=1`.
pub fn image_file_name(url: &str, index: usize) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    let extension = last_segment
        .rsplit_once('.')
        .map(|(_, ext)| sanitize(ext))
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "img".to_string());
    format!("{index:03}.{extension}")
}
