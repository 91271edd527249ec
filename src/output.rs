use std::io::{self, Write};

use serde::Serialize;

use crate::domain::EntityKind;

/// What a run produced: the series directory or chapter file, if any.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub kind: EntityKind,
    pub url: String,
    pub path: Option<String>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Plain,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &DownloadReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub fn print_report(report: &DownloadReport, mode: OutputMode) -> io::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print_report(report),
        OutputMode::Plain => {
            if let Some(path) = &report.path {
                let mut stdout = io::stdout();
                writeln!(stdout, "{path}")?;
            }
            Ok(())
        }
    }
}
