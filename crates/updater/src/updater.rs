use crate::{
    backup::{BackupManager, BackupRecord, PruneReport},
    config::UpdaterConfig,
    error::{Result, UpdaterError},
    fetcher::{ArtifactFetcher, HttpArtifactFetcher, ProgressSender},
    installer,
    lock::InstallLock,
    release::{self, Artifact, AssetSelector, GithubReleaseClient, ReleaseInfo, ReleaseSource, UpdateCheck},
    restart::{platform_relauncher, ProcessRelauncher, RelaunchRequest, RestartTicket},
    rollback::{RollbackExecutor, RollbackOutcome},
    staging::{self, ArchiveStager},
    version,
};
use reqwest::Url;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task;
use tracing::{info, warn};

/// File name of the downloaded archive inside the staging directory.
pub const ARCHIVE_FILE_NAME: &str = "update.zip";

/// Drives the whole update lifecycle of one installation.
///
/// Network work is async; filesystem-heavy stages run on the blocking pool.
/// Mutating operations are serialised in-process and guarded across
/// processes by an [`InstallLock`].
pub struct Updater<S = GithubReleaseClient, F = HttpArtifactFetcher> {
    config: UpdaterConfig,
    source: S,
    fetcher: F,
    selector: AssetSelector,
    stager: Arc<ArchiveStager>,
    backups: BackupManager,
    relauncher: Box<dyn ProcessRelauncher>,
    guard: Mutex<()>,
}

impl Updater {
    /// Updater talking to the configured release endpoint over HTTP.
    pub fn from_config(config: UpdaterConfig) -> Result<Self> {
        let release_url = Url::parse(&config.release_url).map_err(|err| {
            UpdaterError::Config(format!("invalid release_url {:?}: {err}", config.release_url))
        })?;
        let source = GithubReleaseClient::builder()
            .release_url(release_url)
            .user_agent(config.user_agent.clone())
            .timeout(config.metadata_timeout())
            .build()?;
        let fetcher =
            HttpArtifactFetcher::new(config.user_agent.clone(), config.download_timeout())?;
        Self::new(config, source, fetcher)
    }
}

impl<S, F> Updater<S, F>
where
    S: ReleaseSource,
    F: ArtifactFetcher,
{
    /// Create a new updater with the given release source and fetcher.
    pub fn new(config: UpdaterConfig, source: S, fetcher: F) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            selector: AssetSelector::new(
                config.archive_suffix.clone(),
                config.asset_keywords.clone(),
            ),
            backups: BackupManager::new(config.backups_dir()),
            stager: Arc::new(ArchiveStager::default()),
            relauncher: platform_relauncher(),
            guard: Mutex::new(()),
            config,
            source,
            fetcher,
        })
    }

    pub fn with_relauncher(mut self, relauncher: Box<dyn ProcessRelauncher>) -> Self {
        self.relauncher = relauncher;
        self
    }

    pub fn with_stager(mut self, stager: ArchiveStager) -> Self {
        self.stager = Arc::new(stager);
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Version recorded in the installed `package.json`.
    pub fn installed_version(&self) -> String {
        version::installed_version(&self.config.install_dir)
    }

    /// Compare the latest published release with `current_version`.
    pub async fn check_for_updates(&self, current_version: &str) -> Result<UpdateCheck> {
        release::check_for_updates(&self.source, current_version).await
    }

    /// Download the artifact of `release` into a fresh staging directory.
    ///
    /// Any leftover staging directory is replaced. On failure the staging
    /// directory is removed.
    pub async fn download_update(
        &self,
        release: &ReleaseInfo,
        progress: Option<ProgressSender>,
    ) -> Result<DownloadOutcome> {
        let _guard = self.try_guard()?;
        let artifact = self.selector.select(release)?;
        let staging_dir = self.config.staging_dir();

        let install_dir = self.config.install_dir.clone();
        let dir = staging_dir.clone();
        let _lock = blocking(move || {
            let lock = InstallLock::acquire(&install_dir, "download")?;
            staging::remove_dir_if_present(&dir)?;
            fs::create_dir_all(&dir).map_err(UpdaterError::fs(&dir))?;
            Ok(lock)
        })
        .await?;

        let archive_path = staging_dir.join(ARCHIVE_FILE_NAME);
        info!(version = release.version(), url = artifact.url(), "downloading update");
        match self
            .fetcher
            .download(artifact.url(), &archive_path, progress)
            .await
        {
            Ok(fetched) => {
                info!(bytes = fetched.bytes, sha256 = %fetched.sha256, "update downloaded");
                Ok(DownloadOutcome {
                    archive_path: fetched.path,
                    staging_dir,
                    bytes: fetched.bytes,
                    sha256: fetched.sha256,
                    artifact,
                })
            }
            Err(err) => {
                discard_staging(staging_dir).await;
                Err(err)
            }
        }
    }

    /// Extract, back up and install a downloaded archive.
    ///
    /// The backup is complete before the first installed file is touched.
    /// `staging_dir` is removed afterwards whether or not the update applied,
    /// unless it is rejected up front: it must not be or contain the install,
    /// executable or backups directory, and the installation must not be
    /// locked by someone else.
    pub async fn apply_update(&self, archive_path: &Path, staging_dir: &Path) -> Result<ApplyOutcome> {
        let _guard = self.try_guard()?;
        let config = self.config.clone();
        let staging = staging_dir.to_path_buf();
        let _lock = blocking(move || {
            check_staging_dir(&config, &staging)?;
            InstallLock::acquire(&config.install_dir, "apply")
        })
        .await?;

        let result = self.install(archive_path, staging_dir).await;
        discard_staging(staging_dir.to_path_buf()).await;
        result
    }

    async fn install(&self, archive_path: &Path, staging_dir: &Path) -> Result<ApplyOutcome> {
        let config = self.config.clone();
        let stager = Arc::clone(&self.stager);
        let backups = self.backups.clone();
        let archive = archive_path.to_path_buf();
        let staging = staging_dir.to_path_buf();

        let (backup, files_updated) = blocking(move || {
            let content_root = stager.extract(&archive, &staging)?;
            let current = version::installed_version(&config.install_dir);
            let backup = backups.create_backup(&config.install_dir, &config.file_set, &current)?;
            let files = installer::apply(&content_root, &config.install_dir, &config.file_set)?;
            Ok((backup, files))
        })
        .await?;

        let backups = self.backups.clone();
        let keep = self.config.max_backups;
        let pruned = match blocking(move || backups.prune_backups(keep)).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "backup retention failed");
                PruneReport::default()
            }
        };

        info!(backup = %backup.name, files = files_updated, "update applied");
        Ok(ApplyOutcome {
            backup,
            files_updated,
            pruned,
        })
    }

    /// Catalog of restorable backups, newest first.
    pub async fn available_backups(&self) -> Result<Vec<BackupRecord>> {
        let backups = self.backups.clone();
        blocking(move || backups.list_backups()).await
    }

    /// Restore the backup named `name` over the installation.
    pub async fn rollback_to_backup(&self, name: &str) -> Result<RollbackOutcome> {
        let _guard = self.try_guard()?;
        let install_dir = self.config.install_dir.clone();
        let executor = RollbackExecutor::new(self.backups.clone(), install_dir.clone());
        let name = name.to_string();
        blocking(move || {
            let _lock = InstallLock::acquire(&install_dir, "rollback")?;
            executor.rollback(&name)
        })
        .await
    }

    /// Schedule a relaunch of the application. The caller should exit next.
    pub fn restart_app(&self) -> Result<RestartTicket> {
        let executable = match &self.config.launch_target {
            Some(target) => target.clone(),
            None => std::env::current_exe()
                .map_err(|err| UpdaterError::Other(format!("cannot locate executable: {err}")))?,
        };
        let request = RelaunchRequest {
            executable,
            working_dir: self.config.exe_dir.clone(),
            delay: self.config.restart_delay(),
        };
        info!(relauncher = self.relauncher.name(), executable = %request.executable.display(), "scheduling restart");
        self.relauncher.schedule(&request)
    }

    fn try_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.guard
            .try_lock()
            .map_err(|_| UpdaterError::Busy("another update operation is running".into()))
    }
}

async fn blocking<T, Func>(f: Func) -> Result<T>
where
    Func: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
}

/// Staging is wiped after every attempt, so it must not hold anything we keep.
fn check_staging_dir(config: &UpdaterConfig, staging_dir: &Path) -> Result<()> {
    let staging = normalize(staging_dir);
    let backups_dir = config.backups_dir();
    let protected = [
        ("install", &config.install_dir),
        ("executable", &config.exe_dir),
        ("backups", &backups_dir),
    ];
    for (role, dir) in protected {
        if normalize(dir).starts_with(&staging) {
            return Err(UpdaterError::Config(format!(
                "staging directory {} would remove the {role} directory {}",
                staging_dir.display(),
                dir.display()
            )));
        }
    }
    Ok(())
}

/// Canonical form when the path exists, otherwise made absolute.
fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    })
}

async fn discard_staging(dir: PathBuf) {
    let path = dir.clone();
    if let Err(err) = blocking(move || staging::remove_dir_if_present(&dir)).await {
        warn!(path = %path.display(), error = %err, "failed to remove staging directory");
    }
}

/// A downloaded, not yet applied update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub archive_path: PathBuf,
    pub staging_dir: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the archive, for display and logs.
    pub sha256: String,
    pub artifact: Artifact,
}

/// Result of applying an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Backup taken of the previous installation.
    pub backup: BackupRecord,
    pub files_updated: usize,
    pub pruned: PruneReport,
}
