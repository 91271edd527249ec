use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::domain::Chapter;
use crate::error::MangaError;

const TEMP_PREFIX: &str = ".manga-dl-epub";
const PLACEHOLDER_DATE: &str = "0101-01-01T00:00:00+00:00";

static MANIFEST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<manifest\b.*?</manifest>").expect("valid regex"));
static SPINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<spine\b.*?</spine>").expect("valid regex"));
static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<dc:identifier\b[^>]*>(.*?)</dc:identifier>").expect("valid regex")
});

/// Replaces the package metadata of a converted chapter so readers group it
/// under its series, ordered by the chapter index.
///
/// Manifest, spine and every other entry are carried over unchanged. The new
/// book is assembled next to `epub_path` and renamed over it when complete.
pub fn rewrite_metadata(epub_path: &Utf8Path, chapter: &Chapter) -> Result<(), MangaError> {
    let parent = epub_path
        .parent()
        .ok_or_else(|| MangaError::Conversion(format!("invalid epub path: {epub_path}")))?;
    let file = File::open(epub_path)
        .map_err(|err| MangaError::Conversion(format!("open {epub_path}: {err}")))?;
    let mut source = ZipArchive::new(file)
        .map_err(|err| MangaError::Conversion(format!("read {epub_path}: {err}")))?;

    let (opf_name, original) = read_package_document(&mut source, epub_path)?;
    let package = package_document(chapter, &original);

    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(|err| MangaError::Conversion(format!("create temp epub in {parent}: {err}")))?;
    let mut zip = ZipWriter::new(temp);

    for i in 0..source.len() {
        let mut entry = source
            .by_index(i)
            .map_err(|err| MangaError::Conversion(format!("read {epub_path}: {err}")))?;
        let name = entry.name().to_string();
        let options = SimpleFileOptions::default().compression_method(entry.compression());
        zip.start_file(name.as_str(), options)
            .map_err(|err| MangaError::Conversion(format!("add {name} to epub: {err}")))?;
        let written = if name == opf_name {
            zip.write_all(package.as_bytes())
        } else {
            io::copy(&mut entry, &mut zip).map(|_| ())
        };
        written.map_err(|err| MangaError::Conversion(format!("write {name} to epub: {err}")))?;
    }

    let temp = zip
        .finish()
        .map_err(|err| MangaError::Conversion(format!("finish epub {epub_path}: {err}")))?;
    drop(source);
    temp.persist(epub_path)
        .map_err(|err| MangaError::Conversion(format!("replace {epub_path}: {err}")))?;

    debug!("Rewrote metadata of {epub_path} ({opf_name})");
    Ok(())
}

fn read_package_document(
    source: &mut ZipArchive<File>,
    epub_path: &Utf8Path,
) -> Result<(String, String), MangaError> {
    let opf_name = source
        .file_names()
        .find(|name| name.ends_with(".opf"))
        .map(str::to_string)
        .ok_or_else(|| MangaError::Conversion(format!("no package document in {epub_path}")))?;
    let mut entry = source
        .by_name(&opf_name)
        .map_err(|err| MangaError::Conversion(format!("read {opf_name}: {err}")))?;
    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|err| MangaError::Conversion(format!("read {opf_name}: {err}")))?;
    Ok((opf_name, content))
}

fn package_document(chapter: &Chapter, original: &str) -> String {
    let series = chapter.series();
    let identifier = IDENTIFIER
        .captures(original)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str().trim().to_string())
        .filter(|found| !found.is_empty())
        .unwrap_or_else(|| escape(&format!("manga-dl-{}-{}", series.id, chapter.id)));
    let title = escape(&format!("{} - {} ({})", series.id, chapter.name, chapter.id));
    let series_title = escape(&series.title);
    let title_sort = escape(&chapter.name);
    let index = chapter.index;

    let mut document = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="uuid_id" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:identifier opf:scheme="uuid" id="uuid_id">{identifier}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:date>{PLACEHOLDER_DATE}</dc:date>
    <dc:language>eng</dc:language>
    <meta name="cover" content="cover"/>
    <meta name="calibre:series" content="{series_title}"/>
    <meta name="calibre:series_index" content="{index}"/>
    <meta name="calibre:timestamp" content="{PLACEHOLDER_DATE}"/>
    <meta name="calibre:title_sort" content="{title_sort}"/>
  </metadata>
"#
    );
    for section in [MANIFEST.find(original), SPINE.find(original)]
        .into_iter()
        .flatten()
    {
        document.push_str("  ");
        document.push_str(section.as_str());
        document.push('\n');
    }
    document.push_str("</package>\n");
    document
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
