use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::MangaError;
use crate::fetcher::{DEFAULT_REQUEST_TIMEOUT, RetryPolicy};

pub const DEFAULT_CONFIG_FILE: &str = "manga-dl.json";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
pub const DEFAULT_CONVERSION_ARGS: &str =
    "-p KoLC --webtoon --forcecolor --cropping 0 --stretch --upscale --nokepub";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub download_dir: Utf8PathBuf,
    /// Defaults to `history.json` inside `download_dir`.
    pub history_file: Option<Utf8PathBuf>,
    pub skip_existing: bool,
    pub chapter_workers: usize,
    pub image_workers: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Upper bound for one image transfer, body included.
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub convert: bool,
    pub track_single_chapters: bool,
    pub conversion_args: String,
    pub kcc_script: Option<PathBuf>,
    pub python_env: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            download_dir: default_download_dir(),
            history_file: None,
            skip_existing: true,
            chapter_workers: cpus,
            image_workers: cpus * 4,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            convert: false,
            track_single_chapters: true,
            conversion_args: DEFAULT_CONVERSION_ARGS.to_string(),
            kcc_script: None,
            python_env: None,
        }
    }
}

impl AppConfig {
    pub fn history_path(&self) -> Utf8PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.download_dir.join("history.json"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), MangaError> {
        if self.retry_attempts == 0 {
            return Err(MangaError::InvalidConfig(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(MangaError::InvalidConfig(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.chapter_workers == 0 || self.image_workers == 0 {
            return Err(MangaError::InvalidConfig(
                "worker pools need at least one thread".to_string(),
            ));
        }
        Ok(())
    }
}

/// Command line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub download_dir: Option<Utf8PathBuf>,
    pub no_skip: bool,
    pub convert: bool,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub chapter_workers: Option<usize>,
    pub image_workers: Option<usize>,
    pub python_env: Option<PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<AppConfig, MangaError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            AppConfig::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| MangaError::ConfigRead(config_path.clone()))?;
            Self::parse(&content)?
        };

        let config = Self::apply(config, overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<AppConfig, MangaError> {
        serde_json::from_str(content).map_err(|err| MangaError::ConfigParse(err.to_string()))
    }

    pub fn apply(mut config: AppConfig, overrides: ConfigOverrides) -> AppConfig {
        if let Some(dir) = overrides.download_dir {
            if config.history_file.is_none() {
                config.history_file = Some(dir.join("history.json"));
            }
            config.download_dir = dir;
        }
        if overrides.no_skip {
            config.skip_existing = false;
        }
        if overrides.convert {
            config.convert = true;
        }
        if let Some(attempts) = overrides.retry_attempts {
            config.retry_attempts = attempts;
        }
        if let Some(delay) = overrides.retry_delay_ms {
            config.retry_delay_ms = delay;
        }
        if let Some(workers) = overrides.chapter_workers {
            config.chapter_workers = workers;
        }
        if let Some(workers) = overrides.image_workers {
            config.image_workers = workers;
        }
        if overrides.python_env.is_some() {
            config.python_env = overrides.python_env;
        }
        config
    }
}

fn default_download_dir() -> Utf8PathBuf {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join("manga_downloader")).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("manga_downloader"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ConfigLoader::parse(r#"{ "retry_attempts": 5, "convert": true }"#).unwrap();
        assert_eq!(config.retry_attempts, 5);
        assert!(config.convert);
        assert!(config.skip_existing);
        assert_eq!(config.retry_delay_ms, 1000);
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
        assert_eq!(config.history_path(), config.download_dir.join("history.json"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let config = AppConfig {
            retry_attempts: 0,
            ..AppConfig::default()
        };
        assert_matches!(config.validate(), Err(MangaError::InvalidConfig(_)));
    }
}
