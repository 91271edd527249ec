use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use manga_dl::app::{App, Downloader};
use manga_dl::catalog::ManifestResolver;
use manga_dl::config::{ConfigLoader, ConfigOverrides};
use manga_dl::convert::{Converter, KccConverter, NoopConverter};
use manga_dl::error::MangaError;
use manga_dl::fetcher::HttpTransport;
use manga_dl::output::{OutputMode, print_report};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "manga-dl")]
#[command(about = "Download a manga series or chapter into CBZ archives")]
#[command(version, author)]
struct Cli {
    /// URL of the series or chapter to download
    url: String,

    /// Folder the series is saved under (history.json is kept there too)
    destination: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    /// Download chapters again even if the history says they are done
    #[arg(long)]
    no_skip: bool,

    /// Convert finished archives with KCC
    #[arg(long)]
    convert: bool,

    #[arg(long)]
    retry_attempts: Option<u32>,

    #[arg(long)]
    retry_delay_ms: Option<u64>,

    #[arg(long)]
    chapter_workers: Option<usize>,

    #[arg(long)]
    image_workers: Option<usize>,

    /// Python virtual environment used to run KCC
    #[arg(long)]
    venv: Option<std::path::PathBuf>,

    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MangaError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MangaError) -> u8 {
    match error {
        MangaError::Routing(_)
        | MangaError::ConfigRead(_)
        | MangaError::ConfigParse(_)
        | MangaError::InvalidConfig(_) => 2,
        MangaError::Fetch { .. }
        | MangaError::Resolver(_)
        | MangaError::Chapter { .. }
        | MangaError::SeriesIncomplete { .. }
        | MangaError::Conversion(_)
        | MangaError::MissingTool(_) => 3,
        MangaError::Tracker(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = ConfigOverrides {
        download_dir: cli.destination.clone(),
        no_skip: cli.no_skip,
        convert: cli.convert,
        retry_attempts: cli.retry_attempts,
        retry_delay_ms: cli.retry_delay_ms,
        chapter_workers: cli.chapter_workers,
        image_workers: cli.image_workers,
        python_env: cli.venv.clone(),
    };
    let config = ConfigLoader::resolve(cli.config.as_deref(), overrides)?;

    let converter: Box<dyn Converter> = if config.convert {
        Box::new(KccConverter::new(
            config.kcc_script.clone(),
            config.python_env.as_deref(),
            &config.conversion_args,
        ))
    } else {
        Box::new(NoopConverter)
    };
    let transport = HttpTransport::with_timeout(&config.user_agent, config.request_timeout())?;
    let downloader = Downloader::new(&config, transport, converter)?;
    let resolver = ManifestResolver::new(&config.user_agent)?;
    let app = App::new(resolver, downloader);

    let result = app.download_url(&cli.url);
    if !app.downloader().shutdown(SHUTDOWN_TIMEOUT) {
        tracing::warn!("Timed out waiting for in-flight downloads to finish");
    }
    let report = result?;

    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Plain
    };
    print_report(&report, mode).into_diagnostic()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_to_distinct_exit_codes() {
        assert_eq!(map_exit_code(&MangaError::Routing("x".into())), 2);
        assert_eq!(map_exit_code(&MangaError::Conversion("x".into())), 3);
        assert_eq!(map_exit_code(&MangaError::Tracker("x".into())), 4);
        assert_eq!(map_exit_code(&MangaError::Archive("x".into())), 1);
    }
}
