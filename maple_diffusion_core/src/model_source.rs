use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::FetchError;

/// Where the model directory comes from.
///
/// The engine only ever sees a flat directory of per-tensor `.bin` files plus
/// the vocabulary and schedule tables; this type resolves a source down to
/// that directory. Network downloading is an external collaborator and is not
/// handled here: a remote archive must already be on disk.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// An already-populated model directory.
    Directory(PathBuf),
    /// A zip archive of the model directory, extracted on first use.
    ZipArchive {
        archive: PathBuf,
        extract_to: PathBuf,
    },
}

impl ModelSource {
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    pub fn zip_archive(archive: impl Into<PathBuf>, extract_to: impl Into<PathBuf>) -> Self {
        Self::ZipArchive {
            archive: archive.into(),
            extract_to: extract_to.into(),
        }
    }

    /// Resolve the source to a local model directory, extracting the archive
    /// if the target directory is not already populated. `progress` is called
    /// with a fraction in `[0, 1]`.
    pub fn fetch(&self, progress: &mut dyn FnMut(f32)) -> Result<PathBuf, FetchError> {
        match self {
            Self::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(FetchError::MissingSource(dir.clone()));
                }
                progress(1.0);
                Ok(dir.clone())
            }
            Self::ZipArchive {
                archive,
                extract_to,
            } => {
                if dir_is_populated(extract_to) {
                    progress(1.0);
                    return Ok(extract_to.clone());
                }
                if !archive.is_file() {
                    return Err(FetchError::MissingSource(archive.clone()));
                }
                extract_zip(archive, extract_to, progress)?;
                Ok(extract_to.clone())
            }
        }
    }
}

fn dir_is_populated(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn extract_zip(
    archive: &Path,
    target: &Path,
    progress: &mut dyn FnMut(f32),
) -> Result<(), FetchError> {
    info!("extracting model archive {archive:?} to {target:?}");
    fs::create_dir_all(target)?;
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    let total = zip.len();
    for i in 0..total {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        // Flatten: the engine expects a flat content-addressed directory, so
        // only the file name of each entry matters.
        let Some(file_name) = relative.file_name() else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        let out_path = target.join(file_name);
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        progress((i + 1) as f32 / total as f32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn directory_source_requires_existing_dir() {
        let missing = ModelSource::directory("/definitely/not/a/real/path");
        assert!(matches!(
            missing.fetch(&mut |_| {}),
            Err(FetchError::MissingSource(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource::directory(dir.path());
        assert_eq!(source.fetch(&mut |_| {}).unwrap(), dir.path());
    }

    #[test]
    fn zip_source_extracts_once_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("model.zip");
        let target = dir.path().join("model");

        let file = File::create(&archive_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("alphas_cumprod.bin", options).unwrap();
        zip.write_all(b"xyzw").unwrap();
        zip.finish().unwrap();

        let source = ModelSource::zip_archive(&archive_path, &target);
        let mut fractions = Vec::new();
        let resolved = source.fetch(&mut |f| fractions.push(f)).unwrap();
        assert_eq!(resolved, target);
        assert_eq!(fs::read(target.join("alphas_cumprod.bin")).unwrap(), b"xyzw");
        assert_eq!(fractions.last().copied(), Some(1.0));

        // Second fetch sees a populated directory and skips extraction.
        fs::remove_file(&archive_path).unwrap();
        assert_eq!(source.fetch(&mut |_| {}).unwrap(), target);
    }
}
