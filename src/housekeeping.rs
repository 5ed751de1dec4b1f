//! Housekeeping operations: clean the generated trees, archive the output tree.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::config::Config;
use crate::error::{BuildError, Result};
use crate::paths::{slash_path, walk_error};

/// Delete the output and archive roots. Missing directories are fine.
pub fn clean(config: &Config) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in [config.paths.output_root(), config.paths.archive_root()] {
        if !dir.exists() {
            continue;
        }
        fs::remove_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
        crate::debug!("clean"; "removed {}", dir.display());
        removed.push(dir);
    }
    Ok(removed)
}

/// Every file under `dir`, sorted by relative path
fn archive_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn write_archive(file: File, source: &Path, files: &[PathBuf], target: &Path) -> Result<()> {
    let zip_error = |message: String| BuildError::Archive {
        path: target.to_path_buf(),
        message,
    };

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(file);
    for path in files {
        let name = slash_path(path.strip_prefix(source).unwrap_or(path));
        let contents = fs::read(path).map_err(|e| BuildError::io(path, e))?;
        zip.start_file(name, options)
            .map_err(|e| zip_error(e.to_string()))?;
        zip.write_all(&contents)
            .map_err(|e| zip_error(e.to_string()))?;
    }
    zip.finish().map_err(|e| zip_error(e.to_string()))?;
    Ok(())
}

/// ZIP every file under the output root into the archive root.
///
/// Entries carry a fixed timestamp and mode, so the same tree always
/// produces the same bytes. The archive is written beside its final name and
/// renamed into place, so a failed run leaves any previous archive intact.
/// Returns the archive path.
pub fn archive(config: &Config) -> Result<PathBuf> {
    let source = config.paths.output_root();
    let archive_root = config.paths.archive_root();
    let target = archive_root.join(&config.bundles.archive);
    let partial = archive_root.join(format!("{}.part", config.bundles.archive));

    let files = if source.is_dir() {
        archive_entries(&source)?
    } else {
        Vec::new()
    };

    fs::create_dir_all(&archive_root).map_err(|e| BuildError::CreateDirFailed {
        path: archive_root.clone(),
        source: e,
    })?;
    let file = File::create(&partial).map_err(|e| BuildError::WriteFailed {
        path: partial.clone(),
        source: e,
    })?;

    if let Err(e) = write_archive(file, &source, &files, &target) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, &target).map_err(|e| BuildError::WriteFailed {
        path: target.clone(),
        source: e,
    })?;

    crate::debug!("archive"; "{} files -> {}", files.len(), target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn project() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let config = Config::for_root(temp.path());
        (temp, config)
    }

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).unwrap();
                (entry.name().to_string(), contents)
            })
            .collect()
    }

    // ==================== clean tests ====================

    #[test]
    fn test_clean_removes_output_and_archive() {
        let (temp, config) = project();
        write(temp.path(), "dist/scripts/main.min.js", b"x");
        write(temp.path(), "compressed/dist.zip", b"x");
        write(temp.path(), "src/index.html", b"keep");

        let removed = clean(&config).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(!temp.path().join("dist").exists());
        assert!(!temp.path().join("compressed").exists());
        assert!(temp.path().join("src/index.html").exists());
    }

    #[test]
    fn test_clean_missing_directories_is_ok() {
        let (_temp, config) = project();
        assert!(clean(&config).unwrap().is_empty());
    }

    // ==================== archive tests ====================

    #[test]
    fn test_archive_matches_output_tree() {
        let (temp, config) = project();
        write(temp.path(), "dist/index.html", b"<html></html>");
        write(temp.path(), "dist/style/main.min.css", b".a{}");
        write(temp.path(), "dist/images/logo.png", &[0u8, 1, 2, 3]);

        let target = archive(&config).unwrap();

        assert_eq!(target, temp.path().join("compressed/dist.zip"));
        let entries = read_archive(&target);
        assert_eq!(
            entries,
            vec![
                ("images/logo.png".to_string(), vec![0u8, 1, 2, 3]),
                ("index.html".to_string(), b"<html></html>".to_vec()),
                ("style/main.min.css".to_string(), b".a{}".to_vec()),
            ]
        );
    }

    #[test]
    fn test_archive_is_deterministic() {
        let (temp, config) = project();
        write(temp.path(), "dist/a.txt", b"alpha");
        write(temp.path(), "dist/nested/b.txt", b"beta");

        let first = fs::read(archive(&config).unwrap()).unwrap();
        let second = fs::read(archive(&config).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_archive_does_not_include_itself() {
        let (temp, config) = project();
        write(temp.path(), "dist/a.txt", b"alpha");

        archive(&config).unwrap();
        let target = archive(&config).unwrap();

        let names: Vec<String> = read_archive(&target).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_failure_keeps_previous_archive() {
        let (temp, config) = project();
        write(temp.path(), "dist/a.txt", b"alpha");
        let target = archive(&config).unwrap();
        let before = fs::read(&target).unwrap();

        std::os::unix::fs::symlink(temp.path().join("dist"), temp.path().join("dist/loop"))
            .unwrap();
        let err = archive(&config).unwrap_err();

        assert!(matches!(err, BuildError::Io { .. }));
        assert_eq!(fs::read(&target).unwrap(), before);
        assert!(!temp.path().join("compressed/dist.zip.part").exists());
    }

    #[test]
    fn test_archive_leaves_no_partial_file() {
        let (temp, config) = project();
        write(temp.path(), "dist/a.txt", b"alpha");
        archive(&config).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path().join("compressed"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("dist.zip")]);
    }

    #[test]
    fn test_archive_empty_output() {
        let (_temp, config) = project();
        let target = archive(&config).unwrap();
        assert!(read_archive(&target).is_empty());
    }
}
