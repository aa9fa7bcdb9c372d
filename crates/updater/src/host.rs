//! Serializable request results for the desktop shell.
//!
//! Every operation resolves to a [`HostResponse`]: `{"success": true, ...}`
//! with the payload fields flattened in, or `{"success": false, "error": "..."}`.
//! Failures never escape as `Err`.

use crate::backup::BackupRecord;
use crate::error::{Result, UpdaterError};
use crate::fetcher::{ArtifactFetcher, ProgressSender};
use crate::release::{ReleaseAsset, ReleaseInfo, ReleaseSource, UpdateCheck};
use crate::updater::Updater;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;

const NO_RELEASES_MESSAGE: &str = "No releases published yet. You have the latest version.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> HostResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn failed(err: &UpdaterError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            data: None,
        }
    }

    fn from_result(operation: &str, result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => {
                error!(operation, error = %err, "update operation failed");
                Self::failed(&err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPayload {
    pub update_available: bool,
    pub current_version: String,
    pub latest_version: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_releases: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
    pub assets: Vec<ReleaseAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zipball_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tarball_url: Option<String>,
}

impl CheckPayload {
    pub fn from_check(check: &UpdateCheck, current_version: &str) -> Self {
        let Some(release) = check.release() else {
            return Self {
                update_available: false,
                current_version: current_version.to_string(),
                latest_version: current_version.to_string(),
                no_releases: true,
                message: Some(NO_RELEASES_MESSAGE.to_string()),
                release_notes: None,
                published_at: None,
                html_url: None,
                assets: Vec::new(),
                zipball_url: None,
                tarball_url: None,
            };
        };
        Self {
            update_available: check.is_available(),
            current_version: current_version.to_string(),
            latest_version: release.version().to_string(),
            no_releases: false,
            message: None,
            release_notes: Some(release.notes().to_string()),
            published_at: release.published_at,
            html_url: release.html_url.clone(),
            assets: release.assets.clone(),
            zipball_url: release.zipball_url.clone(),
            tarball_url: release.tarball_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadPayload {
    pub zip_path: PathBuf,
    pub temp_dir: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPayload {
    pub backup_dir: PathBuf,
    pub files_updated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub name: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub files: Vec<String>,
    pub legacy: bool,
}

impl From<&BackupRecord> for BackupEntry {
    fn from(record: &BackupRecord) -> Self {
        Self {
            name: record.name.clone(),
            version: record.version.clone(),
            timestamp: record.timestamp,
            files: record.files.clone(),
            legacy: record.is_legacy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupsPayload {
    pub backups: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPayload {
    pub version: String,
    pub files_restored: usize,
}

/// Empty payload for operations that only report success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Done {}

/// `current_version` defaults to the installed `package.json` version.
pub async fn check_for_updates<S, F>(
    updater: &Updater<S, F>,
    current_version: Option<&str>,
) -> HostResponse<CheckPayload>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    let current = current_version
        .map(str::to_owned)
        .unwrap_or_else(|| updater.installed_version());
    let result = updater
        .check_for_updates(&current)
        .await
        .map(|check| CheckPayload::from_check(&check, &current));
    HostResponse::from_result("check", result)
}

pub async fn download_update<S, F>(
    updater: &Updater<S, F>,
    release: &ReleaseInfo,
    progress: Option<ProgressSender>,
) -> HostResponse<DownloadPayload>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    let result = updater
        .download_update(release, progress)
        .await
        .map(|outcome| DownloadPayload {
            zip_path: outcome.archive_path,
            temp_dir: outcome.staging_dir,
            bytes: outcome.bytes,
            sha256: outcome.sha256,
        });
    HostResponse::from_result("download", result)
}

pub async fn apply_update<S, F>(
    updater: &Updater<S, F>,
    zip_path: &Path,
    temp_dir: &Path,
) -> HostResponse<ApplyPayload>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    let result = updater
        .apply_update(zip_path, temp_dir)
        .await
        .map(|outcome| ApplyPayload {
            backup_dir: outcome.backup.path,
            files_updated: outcome.files_updated,
        });
    HostResponse::from_result("apply", result)
}

pub async fn available_backups<S, F>(updater: &Updater<S, F>) -> HostResponse<BackupsPayload>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    let result = updater
        .available_backups()
        .await
        .map(|records| BackupsPayload {
            backups: records.iter().map(BackupEntry::from).collect(),
        });
    HostResponse::from_result("backups", result)
}

pub async fn rollback_to_backup<S, F>(
    updater: &Updater<S, F>,
    name: &str,
) -> HostResponse<RollbackPayload>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    let result = updater
        .rollback_to_backup(name)
        .await
        .map(|outcome| RollbackPayload {
            version: outcome.restored_version,
            files_restored: outcome.restored_files,
        });
    HostResponse::from_result("rollback", result)
}

pub fn restart_app<S, F>(updater: &Updater<S, F>) -> HostResponse<Done>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    HostResponse::from_result("restart", updater.restart_app().map(|_| Done {}))
}
