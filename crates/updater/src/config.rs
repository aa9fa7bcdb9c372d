use crate::error::{Result, UpdaterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Release metadata endpoint of the published application.
pub const DEFAULT_RELEASE_URL: &str =
    "https://api.github.com/repos/marrikTBL/gcsd_inventory/releases/latest";

/// User agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "GCSD-Inventory-Updater/1.0";

/// The persisted data store. Never backed up, installed or restored.
pub const RESERVED_DATA_FILE: &str = "GCSD-DATA.json";

/// Application payload shipped by every release.
pub const DEFAULT_PAYLOAD: &[&str] = &[
    "main.js",
    "preload.js",
    "index.html",
    "updater.js",
    "package.json",
    "icon.png",
    "icon.ico",
];

/// Name of the per-attempt staging directory under `exe_dir`.
pub const STAGING_DIR_NAME: &str = "update_temp";

/// Returns `true` for the reserved data-store file name.
///
/// Comparison ignores ASCII case so that case-insensitive filesystems cannot
/// smuggle the data store past the check.
pub fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case(RESERVED_DATA_FILE)
}

/// A single path component: no separators, drive prefix or dot entries.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == '\\' || c == ':')
}

/// Fixed list of payload file names eligible for backup and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct InstalledFileSet {
    files: Vec<String>,
}

impl InstalledFileSet {
    /// Build a file set; the reserved data-store name and duplicates are dropped.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut files: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            let name = name.trim();
            if name.is_empty() || is_reserved(name) || files.iter().any(|f| f == name) {
                continue;
            }
            files.push(name.to_string());
        }
        Self { files }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for InstalledFileSet {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD.iter().copied())
    }
}

impl From<Vec<String>> for InstalledFileSet {
    fn from(files: Vec<String>) -> Self {
        Self::new(files)
    }
}

impl From<InstalledFileSet> for Vec<String> {
    fn from(set: InstalledFileSet) -> Self {
        set.files
    }
}

/// Everything the updater needs to know about the installation it manages.
///
/// Paths are injected rather than derived from the running executable so the
/// whole pipeline can be pointed at scratch directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Directory holding the installed payload files.
    pub install_dir: PathBuf,
    /// Directory of the executable; hosts staging and restart helpers.
    pub exe_dir: PathBuf,
    /// Where backups are written. Defaults to `exe_dir`.
    pub backups_dir: Option<PathBuf>,
    /// Program relaunched after an update. Defaults to the current executable.
    pub launch_target: Option<PathBuf>,
    pub file_set: InstalledFileSet,
    /// Number of backups kept after a successful update.
    pub max_backups: usize,
    pub release_url: String,
    pub user_agent: String,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Keywords that mark a `.zip` asset as the preferred download.
    pub asset_keywords: Vec<String>,
    pub archive_suffix: String,
    /// How long the restart helper waits before relaunching.
    pub restart_delay_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("."),
            exe_dir: PathBuf::from("."),
            backups_dir: None,
            launch_target: None,
            file_set: InstalledFileSet::default(),
            max_backups: 5,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            metadata_timeout_secs: 30,
            download_timeout_secs: 300,
            asset_keywords: ["win", "gcsd", "inventory", "desktop"]
                .into_iter()
                .map(String::from)
                .collect(),
            archive_suffix: ".zip".to_string(),
            restart_delay_secs: 2,
        }
    }
}

impl UpdaterConfig {
    /// Configuration for an installation whose payload and executable share a directory.
    pub fn for_install_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            install_dir: dir.clone(),
            exe_dir: dir,
            ..Self::default()
        }
    }

    /// Load a JSON configuration file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(UpdaterError::fs(path))?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|err| UpdaterError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_set.is_empty() {
            return Err(UpdaterError::Config("file_set must not be empty".into()));
        }
        if let Some(bad) = self.file_set.iter().find(|name| !is_plain_file_name(name)) {
            return Err(UpdaterError::Config(format!(
                "file_set entries must be plain file names, got {bad:?}"
            )));
        }
        if self.max_backups == 0 {
            return Err(UpdaterError::Config("max_backups must be at least 1".into()));
        }
        if self.archive_suffix.is_empty() {
            return Err(UpdaterError::Config("archive_suffix must not be empty".into()));
        }
        Ok(())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.backups_dir
            .clone()
            .unwrap_or_else(|| self.exe_dir.clone())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.exe_dir.join(STAGING_DIR_NAME)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_set_never_contains_reserved_name() {
        let set = InstalledFileSet::new(["main.js", "GCSD-DATA.json", "gcsd-data.JSON", "main.js"]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["main.js"]);
        assert!(!InstalledFileSet::default().iter().any(is_reserved));
    }

    #[test]
    fn deserialized_file_set_drops_reserved_name() {
        let set: InstalledFileSet =
            serde_json::from_str(r#"["index.html", "GCSD-DATA.json"]"#).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("index.html"));
    }

    #[test]
    fn plain_file_names() {
        assert!(is_plain_file_name("main.js"));
        assert!(is_plain_file_name(".hidden"));
        for bad in ["", ".", "..", "../x", "/etc/passwd", "a\\b", "C:evil.js"] {
            assert!(!is_plain_file_name(bad), "{bad:?}");
        }
    }

    #[test]
    fn backups_default_to_exe_dir() {
        let config = UpdaterConfig::for_install_dir("/opt/gcsd");
        assert_eq!(config.backups_dir(), PathBuf::from("/opt/gcsd"));
        assert_eq!(config.staging_dir(), PathBuf::from("/opt/gcsd/update_temp"));
    }

    #[test]
    fn json_file_overrides_selected_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.json");
        std::fs::write(
            &path,
            r#"{"install_dir":"/srv/app","max_backups":2,"file_set":["main.js","index.html"]}"#,
        )
        .unwrap();

        let config = UpdaterConfig::from_json_file(&path).unwrap();
        assert_eq!(config.install_dir, PathBuf::from("/srv/app"));
        assert_eq!(config.max_backups, 2);
        assert_eq!(config.file_set.len(), 2);
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = UpdaterConfig::default();
        config.max_backups = 0;
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));

        let mut config = UpdaterConfig::default();
        config.file_set = InstalledFileSet::new(["../escape.js"]);
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));

        let mut config = UpdaterConfig::default();
        config.file_set = InstalledFileSet::new(["GCSD-DATA.json"]);
        assert!(matches!(config.validate(), Err(UpdaterError::Config(_))));
    }
}
