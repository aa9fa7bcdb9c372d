//! Release-driven self-update engine for the GCSD Inventory desktop application.
//!
//! The updater asks a release endpoint for the latest published release,
//! downloads its archive into a staging directory, backs up the installed
//! payload files and copies the new ones over them. Backups can be listed and
//! restored later, and the application can be relaunched through a detached
//! helper script once the host process exits. The persisted data store
//! (`GCSD-DATA.json`) is never touched by any of these steps.
//!
//! ```ignore
//! use updater::{UpdateCheck, Updater, UpdaterConfig};
//!
//! # async fn demo() -> updater::Result<()> {
//! let updater = Updater::from_config(UpdaterConfig::for_install_dir("/opt/gcsd"))?;
//! let current = updater.installed_version();
//!
//! if let UpdateCheck::Available(release) = updater.check_for_updates(&current).await? {
//!     let download = updater.download_update(&release, None).await?;
//!     let applied = updater
//!         .apply_update(&download.archive_path, &download.staging_dir)
//!         .await?;
//!     println!("backed up to {}", applied.backup.path.display());
//!     updater.restart_app()?;
//! }
//! # Ok(())
//! # }
//! ```

mod backup;
mod config;
mod error;
mod fetcher;
pub mod host;
mod http;
mod installer;
mod lock;
mod release;
mod restart;
mod rollback;
mod staging;
mod updater;
pub mod version;

pub use backup::{
    BackupLayout, BackupManager, BackupManifest, BackupRecord, PruneReport, BACKUP_PREFIX,
    MANIFEST_FILE,
};
pub use config::{
    is_plain_file_name, is_reserved, InstalledFileSet, UpdaterConfig, DEFAULT_PAYLOAD, DEFAULT_RELEASE_URL,
    DEFAULT_USER_AGENT, RESERVED_DATA_FILE, STAGING_DIR_NAME,
};
pub use error::{Result, UpdaterError};
pub use fetcher::{
    ArtifactFetcher, DownloadProgress, FetchedArtifact, HttpArtifactFetcher, ProgressSender,
};
pub use http::MAX_REDIRECTS;
pub use installer::apply as install_payload;
pub use lock::{InstallLock, LockInfo, LOCK_FILE};
pub use release::{
    check_for_updates, select_artifact, Artifact, AssetSelector, GithubReleaseClient,
    GithubReleaseClientBuilder, ReleaseAsset, ReleaseInfo, ReleaseSource, UpdateCheck,
};
pub use restart::{
    platform_relauncher, ProcessRelauncher, RelaunchRequest, RestartTicket, ShellRelauncher,
    WindowsScriptRelauncher,
};
pub use rollback::{RollbackExecutor, RollbackOutcome};
pub use staging::{ArchiveExtractor, ArchiveStager, TarGzExtractor, ZipExtractor};
pub use updater::{ApplyOutcome, DownloadOutcome, Updater, ARCHIVE_FILE_NAME};
pub use version::{is_newer, VersionTriple};
