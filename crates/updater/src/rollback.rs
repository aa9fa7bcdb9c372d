use crate::backup::{BackupManager, BackupRecord};
use crate::config::is_reserved;
use crate::error::{Result, UpdaterError};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Result of restoring a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub backup: BackupRecord,
    pub restored_version: String,
    pub restored_files: usize,
}

/// Copies the files of a cataloged backup back over the installation.
///
/// Files are only overwritten or created; nothing in the installation is
/// deleted, so files added by a later release survive a rollback.
#[derive(Debug, Clone)]
pub struct RollbackExecutor {
    backups: BackupManager,
    install_dir: PathBuf,
}

impl RollbackExecutor {
    pub fn new(backups: BackupManager, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            backups,
            install_dir: install_dir.into(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn rollback(&self, backup_id: &str) -> Result<RollbackOutcome> {
        let backup = self.backups.find(backup_id)?;
        fs::create_dir_all(&self.install_dir).map_err(UpdaterError::fs(&self.install_dir))?;

        let mut restored = 0usize;
        for name in &backup.files {
            if is_reserved(name) {
                continue;
            }
            let source = backup.path.join(name);
            if !source.is_file() {
                warn!(file = %name, backup = %backup.name, "file listed in backup is missing");
                continue;
            }
            let target = self.install_dir.join(name);
            fs::copy(&source, &target).map_err(UpdaterError::fs(&target))?;
            debug!(file = %name, "restored");
            restored += 1;
        }

        info!(
            backup = %backup.name,
            version = %backup.version,
            files = restored,
            "rollback complete"
        );
        Ok(RollbackOutcome {
            restored_version: backup.version.clone(),
            restored_files: restored,
            backup,
        })
    }
}
