use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::archive::is_archive;
use crate::domain::Chapter;
use crate::epub;
use crate::error::MangaError;

/// Post-processing step that turns finished CBZ archives into another format.
pub trait Converter: Send + Sync {
    /// Converts the given chapters and returns the paths of the converted files.
    fn convert_all(&self, chapters: &[&Chapter]) -> Result<Vec<Utf8PathBuf>, MangaError>;
}

impl<C: Converter + ?Sized> Converter for Box<C> {
    fn convert_all(&self, chapters: &[&Chapter]) -> Result<Vec<Utf8PathBuf>, MangaError> {
        (**self).convert_all(chapters)
    }
}

/// Used when conversion is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConverter;

impl Converter for NoopConverter {
    fn convert_all(&self, _chapters: &[&Chapter]) -> Result<Vec<Utf8PathBuf>, MangaError> {
        Ok(Vec::new())
    }
}

/// Kindle Comic Converter driven through its python entry script.
#[derive(Debug)]
pub struct KccConverter {
    python: PathBuf,
    script: Option<PathBuf>,
    arguments: Vec<String>,
    available: OnceLock<Result<(), String>>,
}

impl KccConverter {
    pub fn new(script: Option<PathBuf>, python_env: Option<&Path>, arguments: &str) -> Self {
        let script = script
            .or_else(|| std::env::var_os("KCC_SCRIPT").map(PathBuf::from))
            .filter(|path| !path.as_os_str().is_empty());
        Self {
            python: python_binary(python_env),
            script,
            arguments: arguments.split_whitespace().map(str::to_string).collect(),
            available: OnceLock::new(),
        }
    }

    fn script(&self) -> Result<&Path, MangaError> {
        self.script.as_deref().ok_or_else(|| {
            MangaError::MissingTool("KCC script (set kcc_script or KCC_SCRIPT)".to_string())
        })
    }

    fn ensure_available(&self) -> Result<(), MangaError> {
        let script = self.script()?;
        let probe = self.available.get_or_init(|| {
            debug!("Probing KCC at {}", script.display());
            self.run(&[script.to_string_lossy().to_string(), "--help".to_string()])
                .map_err(|err| err.to_string())
        });
        match probe {
            Ok(()) => Ok(()),
            Err(message) => Err(MangaError::MissingTool(format!("KCC is unavailable: {message}"))),
        }
    }

    fn convert_one(
        &self,
        chapter: &Chapter,
        archive_path: &Utf8Path,
    ) -> Result<Utf8PathBuf, MangaError> {
        let script = self.script()?;
        let mut args = vec![
            script.to_string_lossy().to_string(),
            archive_path.to_string(),
        ];
        args.extend(self.arguments.iter().cloned());
        self.run(&args).map_err(|err| {
            MangaError::Conversion(format!("error converting {archive_path}: {err}"))
        })?;

        let epub_path = archive_path.with_extension("epub");
        epub::rewrite_metadata(&epub_path, chapter)?;
        fs::remove_file(archive_path).map_err(|err| {
            MangaError::Conversion(format!("remove converted archive {archive_path}: {err}"))
        })?;
        info!("Successfully converted {archive_path} to {epub_path}");
        Ok(epub_path)
    }

    fn run(&self, args: &[String]) -> Result<(), MangaError> {
        debug!("Executing: {} {}", self.python.display(), args.join(" "));
        let output = Command::new(&self.python)
            .args(args)
            .output()
            .map_err(|err| MangaError::Conversion(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {}", self.python.display())
        } else {
            stderr
        };
        Err(MangaError::Conversion(message))
    }
}

impl Converter for KccConverter {
    fn convert_all(&self, chapters: &[&Chapter]) -> Result<Vec<Utf8PathBuf>, MangaError> {
        let archives = chapters
            .iter()
            .filter_map(|chapter| {
                chapter
                    .archive_path()
                    .filter(|path| is_archive(path))
                    .map(|path| (*chapter, path))
            })
            .collect::<Vec<_>>();
        if archives.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_available()?;
        archives
            .into_iter()
            .map(|(chapter, archive)| self.convert_one(chapter, archive))
            .collect()
    }
}

fn python_binary(python_env: Option<&Path>) -> PathBuf {
    match python_env {
        Some(env) if cfg!(windows) => env.join("Scripts").join("python.exe"),
        Some(env) => env.join("bin").join("python"),
        None => PathBuf::from("python"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::SeriesInfo;

    #[test]
    fn virtualenv_python_is_preferred() {
        let python = python_binary(Some(Path::new("/opt/venv")));
        if cfg!(windows) {
            assert!(python.ends_with("Scripts/python.exe"));
        } else {
            assert_eq!(python, PathBuf::from("/opt/venv/bin/python"));
        }
        assert_eq!(python_binary(None), PathBuf::from("python"));
    }

    #[test]
    fn nothing_to_convert_needs_no_tool() {
        let converter = KccConverter {
            python: PathBuf::from("python"),
            script: None,
            arguments: vec![],
            available: OnceLock::new(),
        };
        let chapter = Chapter::new(Arc::new(SeriesInfo::new(1, "s", "S")), "1", "c", "C", vec![]);
        assert!(converter.convert_all(&[&chapter]).unwrap().is_empty());

        chapter.set_archive_path(Utf8PathBuf::from("/tmp/c/c.cbz"));
        let err = converter.convert_all(&[&chapter]).unwrap_err();
        assert_matches!(err, MangaError::MissingTool(_));
    }

    #[test]
    fn arguments_are_split_on_whitespace() {
        let converter = KccConverter::new(
            Some(PathBuf::from("kcc-c2e.py")),
            None,
            "-p KoLC  --webtoon --nokepub",
        );
        assert_eq!(converter.arguments, vec!["-p", "KoLC", "--webtoon", "--nokepub"]);
    }
}
