use std::fs::{self, File};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::MangaError;

pub const ARCHIVE_EXTENSION: &str = "cbz";
const TEMP_PREFIX: &str = ".manga-dl-archive";

/// Packs every file under `source_dir` into `<source_dir>/<dir name>.cbz`.
///
/// Entries are sorted by relative path. The archive is assembled in a temp
/// file beside the target and only renamed into place once complete.
pub fn build_archive(source_dir: &Utf8Path) -> Result<Utf8PathBuf, MangaError> {
    let dir_name = source_dir
        .file_name()
        .ok_or_else(|| MangaError::Archive(format!("invalid chapter directory: {source_dir}")))?;
    let archive_path = source_dir.join(format!("{dir_name}.{ARCHIVE_EXTENSION}"));

    let files = archive_inputs(source_dir)?;

    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(source_dir)
        .map_err(|err| MangaError::Archive(format!("create temp archive in {source_dir}: {err}")))?;
    let mut zip = ZipWriter::new(temp);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for relative in &files {
        let path = source_dir.join(relative);
        let entry_name = relative.as_str().replace('\\', "/");
        zip.start_file(entry_name, options)
            .map_err(|err| MangaError::Archive(format!("add {relative} to archive: {err}")))?;
        let mut input = File::open(&path)
            .map_err(|err| MangaError::Archive(format!("open {path}: {err}")))?;
        io::copy(&mut input, &mut zip)
            .map_err(|err| MangaError::Archive(format!("write {relative} to archive: {err}")))?;
    }

    let temp = zip
        .finish()
        .map_err(|err| MangaError::Archive(format!("finish archive {archive_path}: {err}")))?;
    temp.persist(&archive_path)
        .map_err(|err| MangaError::Archive(format!("place archive {archive_path}: {err}")))?;

    debug!("Created archive: {archive_path} ({} entries)", files.len());
    Ok(archive_path)
}

/// Deletes everything `build_archive` packed. Failures are only logged.
pub fn cleanup_images(source_dir: &Utf8Path) {
    let files = match archive_inputs(source_dir) {
        Ok(files) => files,
        Err(err) => {
            warn!("Error walking directory for cleanup: {err}");
            return;
        }
    };

    let total = files.len();
    let mut deleted = 0usize;
    for relative in files {
        let path = source_dir.join(&relative);
        match fs::remove_file(&path) {
            Ok(()) => deleted += 1,
            Err(err) => warn!("Failed to delete temporary image file: {path}: {err}"),
        }
    }

    if deleted == total && total > 0 {
        debug!("Cleaned up all {total} temporary image files");
    } else if deleted > 0 {
        warn!("Cleaned up {deleted} out of {total} temporary image files");
    } else {
        warn!("No temporary image files were cleaned up");
    }
}

/// Entry names of an archive in stored order.
pub fn archive_entries(archive_path: &Utf8Path) -> Result<Vec<String>, MangaError> {
    let file = File::open(archive_path)
        .map_err(|err| MangaError::Archive(format!("open {archive_path}: {err}")))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| MangaError::Archive(err.to_string()))?;
    (0..archive.len())
        .map(|i| {
            archive
                .by_index(i)
                .map(|entry| entry.name().to_string())
                .map_err(|err| MangaError::Archive(err.to_string()))
        })
        .collect()
}

pub fn is_archive(path: &Utf8Path) -> bool {
    path.extension() == Some(ARCHIVE_EXTENSION)
}

fn archive_inputs(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, MangaError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).map_err(|err| MangaError::Archive(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| MangaError::Archive(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|path| {
                MangaError::Archive(format!("non UTF-8 path: {}", path.display()))
            })?;
            let file_type = entry
                .file_type()
                .map_err(|err| MangaError::Archive(format!("stat {path}: {err}")))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let hidden_temp = path
                .file_name()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if !file_type.is_file() || is_archive(&path) || hidden_temp {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap();
        fs::create_dir_all(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn entries_follow_page_order() {
        let (_guard, dir) = temp_dir("1_Chapter_1");
        for index in [3, 1, 10, 2] {
            fs::write(dir.join(format!("{index:03}.jpg")), [index as u8]).unwrap();
        }

        let archive = build_archive(&dir).unwrap();
        assert_eq!(archive, dir.join("1_Chapter_1.cbz"));
        assert_eq!(
            archive_entries(&archive).unwrap(),
            vec!["001.jpg", "002.jpg", "003.jpg", "010.jpg"]
        );
    }

    #[test]
    fn rebuild_skips_previous_archive_and_nested_paths_are_relative() {
        let (_guard, dir) = temp_dir("ch");
        fs::write(dir.join("001.png"), b"a").unwrap();
        fs::create_dir_all(dir.join("extra")).unwrap();
        fs::write(dir.join("extra").join("notes.txt"), b"b").unwrap();

        build_archive(&dir).unwrap();
        let archive = build_archive(&dir).unwrap();
        assert_eq!(
            archive_entries(&archive).unwrap(),
            vec!["001.png", "extra/notes.txt"]
        );
    }

    #[test]
    fn cleanup_keeps_only_the_archive() {
        let (_guard, dir) = temp_dir("ch");
        fs::write(dir.join("001.png"), b"a").unwrap();
        fs::write(dir.join("002.png"), b"b").unwrap();
        let archive = build_archive(&dir).unwrap();

        cleanup_images(&dir);

        let remaining = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec!["ch.cbz".to_string()]);
        assert!(archive.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_image_leaves_no_archive() {
        use std::os::unix::fs::PermissionsExt;

        let (_guard, dir) = temp_dir("ch");
        let locked = dir.join("001.png");
        fs::write(&locked, b"a").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&locked).is_ok() {
            // running as root, permissions are not enforced
            return;
        }

        assert!(build_archive(&dir).is_err());
        assert!(!dir.join("ch.cbz").exists());
    }
}
