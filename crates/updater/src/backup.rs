//! File-level backups of the installed payload.
//!
//! Backups live as `backup_*` directories under the backups directory. The
//! directory tree is the source of truth: the catalog is rebuilt by scanning
//! it on every call. Two layouts are recognised:
//!
//! * structured: carries a [`MANIFEST_FILE`] naming the version, creation
//!   time and exact list of captured files;
//! * legacy: a bare `backup_<epoch millis>` directory written by older
//!   releases, whose metadata has to be inferred.

use crate::config::{is_plain_file_name, is_reserved, InstalledFileSet};
use crate::error::{Result, UpdaterError};
use crate::version;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest written into every structured backup.
pub const MANIFEST_FILE: &str = "backup-manifest.json";

/// Prefix shared by every backup directory.
pub const BACKUP_PREFIX: &str = "backup_";

const UNKNOWN_VERSION: &str = "unknown";
const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<String>,
}

/// How a backup directory describes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum BackupLayout {
    Structured { manifest: BackupManifest },
    Legacy { inferred_version: String },
}

/// One entry of the backup catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    /// Directory name; doubles as the backup identifier.
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Files held by the backup, relative to its directory.
    pub files: Vec<String>,
    pub layout: BackupLayout,
}

impl BackupRecord {
    pub fn is_legacy(&self) -> bool {
        matches!(self.layout, BackupLayout::Legacy { .. })
    }
}

/// Backups removed by a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<String>,
    /// Backups that could not be deleted; left on disk.
    pub failed: Vec<String>,
}

/// Creates, lists and prunes backups in a single directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backups_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            backups_dir: backups_dir.into(),
        }
    }

    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Snapshot the files of `file_set` present in `install_dir`.
    pub fn create_backup(
        &self,
        install_dir: &Path,
        file_set: &InstalledFileSet,
        version: &str,
    ) -> Result<BackupRecord> {
        self.create_backup_at(install_dir, file_set, version, Utc::now())
    }

    /// Same as [`create_backup`](Self::create_backup) with an explicit creation time.
    pub fn create_backup_at(
        &self,
        install_dir: &Path,
        file_set: &InstalledFileSet,
        version: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<BackupRecord> {
        fs::create_dir_all(&self.backups_dir).map_err(UpdaterError::fs(&self.backups_dir))?;
        let base = format!(
            "{BACKUP_PREFIX}{}_{}",
            sanitize_version(version),
            timestamp.format("%Y%m%dT%H%M%S%3fZ")
        );
        let (name, path) = self.reserve_dir(&base)?;

        match capture(install_dir, &path, file_set, version, timestamp) {
            Ok(manifest) => {
                info!(backup = %name, files = manifest.files.len(), "backup created");
                Ok(BackupRecord {
                    name,
                    path,
                    version: manifest.version.clone(),
                    timestamp,
                    files: manifest.files.clone(),
                    layout: BackupLayout::Structured { manifest },
                })
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %cleanup, "failed to remove partial backup");
                }
                Err(err)
            }
        }
    }

    fn reserve_dir(&self, base: &str) -> Result<(String, PathBuf)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                base.to_string()
            } else {
                format!("{base}_{attempt}")
            };
            let path = self.backups_dir.join(&name);
            match fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(UpdaterError::fs(&path)(err)),
            }
        }
        Err(UpdaterError::Other(format!(
            "could not find a free backup name for {base}"
        )))
    }

    /// Catalog of backups, newest first. A missing directory is an empty catalog.
    pub fn list_backups(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(UpdaterError::fs(&self.backups_dir)(err)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable backup entry");
                    continue;
                }
            };
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.starts_with(BACKUP_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            match load_record(name.clone(), entry.path()) {
                Ok(record) => records.push(record),
                Err(err) => warn!(backup = %name, error = %err, "skipping unreadable backup"),
            }
        }

        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(records)
    }

    /// Look up a backup by directory name.
    pub fn find(&self, name: &str) -> Result<BackupRecord> {
        self.list_backups()?
            .into_iter()
            .find(|record| record.name == name)
            .ok_or_else(|| UpdaterError::BackupNotFound(name.to_string()))
    }

    /// Delete everything past the `keep` newest backups.
    ///
    /// Each deletion stands alone; failures are reported and logged.
    pub fn prune_backups(&self, keep: usize) -> Result<PruneReport> {
        self.prune_with(keep, |path| fs::remove_dir_all(path))
    }

    fn prune_with<R>(&self, keep: usize, mut remove: R) -> Result<PruneReport>
    where
        R: FnMut(&Path) -> io::Result<()>,
    {
        let mut report = PruneReport::default();
        for record in self.list_backups()?.into_iter().skip(keep) {
            match remove(&record.path) {
                Ok(()) => {
                    debug!(backup = %record.name, "pruned backup");
                    report.removed.push(record.name);
                }
                Err(err) => {
                    warn!(backup = %record.name, error = %err, "failed to prune backup");
                    report.failed.push(record.name);
                }
            }
        }
        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), keep, "pruned old backups");
        }
        Ok(report)
    }
}

fn capture(
    install_dir: &Path,
    backup_dir: &Path,
    file_set: &InstalledFileSet,
    version: &str,
    timestamp: DateTime<Utc>,
) -> Result<BackupManifest> {
    let mut files = Vec::new();
    for name in file_set.iter() {
        if is_reserved(name) {
            continue;
        }
        let source = install_dir.join(name);
        if !source.is_file() {
            debug!(file = name, "not installed, nothing to back up");
            continue;
        }
        let target = backup_dir.join(name);
        fs::copy(&source, &target).map_err(UpdaterError::fs(&source))?;
        debug!(file = name, "backed up");
        files.push(name.to_string());
    }

    let manifest = BackupManifest {
        version: version.to_string(),
        timestamp,
        files,
    };
    // Written last: a directory with a manifest is a complete backup.
    let manifest_path = backup_dir.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .map_err(UpdaterError::fs(&manifest_path))?;
    Ok(manifest)
}

fn load_record(name: String, path: PathBuf) -> Result<BackupRecord> {
    let manifest_path = path.join(MANIFEST_FILE);
    if manifest_path.is_file() {
        let bytes = fs::read(&manifest_path).map_err(UpdaterError::fs(&manifest_path))?;
        let manifest: BackupManifest = serde_json::from_slice(&bytes)?;
        if let Some(bad) = manifest.files.iter().find(|file| !is_plain_file_name(file)) {
            return Err(UpdaterError::validation(format!(
                "manifest lists {bad:?}, which is not a plain file name"
            )));
        }
        return Ok(BackupRecord {
            name,
            path,
            version: manifest.version.clone(),
            timestamp: manifest.timestamp,
            files: manifest.files.clone(),
            layout: BackupLayout::Structured { manifest },
        });
    }

    let inferred_version =
        version::package_version(&path).unwrap_or_else(|| UNKNOWN_VERSION.to_string());
    let timestamp = match legacy_timestamp(&name) {
        Some(timestamp) => timestamp,
        None => {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map_err(UpdaterError::fs(&path))?;
            DateTime::<Utc>::from(modified)
        }
    };
    let files = legacy_files(&path)?;

    Ok(BackupRecord {
        name,
        path,
        version: inferred_version.clone(),
        timestamp,
        files,
        layout: BackupLayout::Legacy { inferred_version },
    })
}

fn legacy_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = name.strip_prefix(BACKUP_PREFIX)?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn legacy_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(UpdaterError::fs(dir))? {
        let entry = entry.map_err(UpdaterError::fs(dir))?;
        if !entry.file_type().map_err(UpdaterError::fs(entry.path()))?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name == MANIFEST_FILE || is_reserved(&name) {
            continue;
        }
        files.push(name);
    }
    files.sort();
    Ok(files)
}

fn sanitize_version(version: &str) -> String {
    let cleaned: String = version
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        cleaned
    }
}
