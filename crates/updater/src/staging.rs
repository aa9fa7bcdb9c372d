//! Unpacking downloaded archives into the staging directory.
//!
//! Extraction is attempted with each registered [`ArchiveExtractor`] in turn;
//! the extraction directory is wiped before every attempt so a failed attempt
//! never leaks files into the next one.

use crate::error::{Result, UpdaterError};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info, warn};

/// Subdirectory of the staging directory that receives archive contents.
pub const EXTRACT_DIR_NAME: &str = "extracted";

/// One way of unpacking an archive.
pub trait ArchiveExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unpack `archive` into the existing, empty directory `destination`.
    ///
    /// Entries that would land outside `destination` must be rejected.
    fn extract(&self, archive: &Path, destination: &Path) -> Result<()>;
}

/// Unpacks `.zip` archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn extract(&self, archive: &Path, destination: &Path) -> Result<()> {
        let file = File::open(archive).map_err(UpdaterError::fs(archive))?;
        let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(zip_error)?;
            let relative: PathBuf = match entry.enclosed_name() {
                Some(path) => path.to_path_buf(),
                None => {
                    return Err(UpdaterError::Extraction(format!(
                        "entry {:?} escapes the extraction directory",
                        entry.name()
                    )))
                }
            };
            let target = destination.join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(UpdaterError::fs(&target))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(UpdaterError::fs(parent))?;
            }
            let mut out = File::create(&target).map_err(UpdaterError::fs(&target))?;
            io::copy(&mut entry, &mut out).map_err(UpdaterError::fs(&target))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    let perms = fs::Permissions::from_mode((mode & 0o777) | 0o600);
                    fs::set_permissions(&target, perms).map_err(UpdaterError::fs(&target))?;
                }
            }
        }
        Ok(())
    }
}

fn zip_error(err: zip::result::ZipError) -> UpdaterError {
    UpdaterError::Extraction(format!("zip: {err}"))
}

/// Unpacks gzip-compressed tarballs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn name(&self) -> &'static str {
        "tar.gz"
    }

    fn extract(&self, archive: &Path, destination: &Path) -> Result<()> {
        let file = File::open(archive).map_err(UpdaterError::fs(archive))?;
        let mut tarball = tar::Archive::new(GzDecoder::new(file));
        let entries = tarball.entries().map_err(tar_error)?;

        for entry in entries {
            let mut entry = entry.map_err(tar_error)?;
            let path = entry.path().map_err(tar_error)?.into_owned();
            match entry.header().entry_type() {
                EntryType::Regular | EntryType::Directory => {}
                // GitHub tarballs lead with a comment header carrying the commit id.
                EntryType::XGlobalHeader | EntryType::XHeader => continue,
                EntryType::Symlink | EntryType::Link => {
                    warn!(entry = %path.display(), "skipping link entry in tarball");
                    continue;
                }
                other => {
                    return Err(UpdaterError::Extraction(format!(
                        "unsupported entry type {other:?} for {}",
                        path.display()
                    )))
                }
            }
            let unpacked = entry.unpack_in(destination).map_err(tar_error)?;
            if !unpacked {
                return Err(UpdaterError::Extraction(format!(
                    "entry {} escapes the extraction directory",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

fn tar_error(err: io::Error) -> UpdaterError {
    UpdaterError::Extraction(format!("tar: {err}"))
}

/// Turns a downloaded archive into a directory of files ready to install.
pub struct ArchiveStager {
    extractors: Vec<Box<dyn ArchiveExtractor>>,
}

impl Default for ArchiveStager {
    fn default() -> Self {
        Self::new(vec![Box::new(ZipExtractor), Box::new(TarGzExtractor)])
    }
}

impl ArchiveStager {
    /// Extractors are tried in the given order.
    pub fn new(extractors: Vec<Box<dyn ArchiveExtractor>>) -> Self {
        Self { extractors }
    }

    /// Extract `archive` below `staging_dir` and return the content root.
    ///
    /// If every extractor fails the extraction directory is removed and
    /// [`UpdaterError::Extraction`] is returned.
    #[tracing::instrument(skip_all, fields(archive = %archive.display()))]
    pub fn extract(&self, archive: &Path, staging_dir: &Path) -> Result<PathBuf> {
        let destination = staging_dir.join(EXTRACT_DIR_NAME);
        let mut failures = Vec::new();

        for extractor in &self.extractors {
            reset_dir(&destination)?;
            match extractor.extract(archive, &destination) {
                Ok(()) => {
                    let root = resolve_content_root(&destination)?;
                    info!(
                        extractor = extractor.name(),
                        root = %root.display(),
                        "archive extracted"
                    );
                    return Ok(root);
                }
                Err(err) => {
                    debug!(extractor = extractor.name(), error = %err, "extraction attempt failed");
                    failures.push(format!("{}: {err}", extractor.name()));
                }
            }
        }

        if let Err(err) = remove_dir_if_present(&destination) {
            warn!(path = %destination.display(), error = %err, "failed to clean extraction directory");
        }
        Err(UpdaterError::Extraction(if failures.is_empty() {
            "no extractor configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

/// The directory itself, or its only child when that child is a directory.
pub fn resolve_content_root(dir: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(dir)
        .map_err(UpdaterError::fs(dir))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(UpdaterError::fs(dir))?;

    if entries.len() == 1 {
        let only = entries.remove(0);
        if only.file_type().map_err(UpdaterError::fs(only.path()))?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(dir.to_path_buf())
}

fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir_if_present(dir)?;
    fs::create_dir_all(dir).map_err(UpdaterError::fs(dir))
}

pub(crate) fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdaterError::fs(dir)(err)),
    }
}
