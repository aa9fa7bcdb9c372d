use std::io;
use std::path::{Path, PathBuf};

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while checking for, applying or rolling back an update.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// A request could not be sent or its body could not be read.
    #[error("network request failed: {0}")]
    Network(String),
    /// The server answered with a status other than the one expected.
    #[error("HTTP {status} from {url}")]
    Status {
        /// URL that produced the status (after redirects).
        url: String,
        /// Status code returned by the server.
        status: reqwest::StatusCode,
    },
    /// The request did not finish within the configured bound.
    #[error("request to {0} timed out")]
    Timeout(String),
    /// Redirect chain exceeded the hop cap.
    #[error("too many redirects while fetching {url} (limit {limit})")]
    RedirectLoop {
        /// URL of the original request.
        url: String,
        /// Maximum number of redirects that are followed.
        limit: usize,
    },
    /// No release has been published yet.
    #[error("no releases published yet")]
    NoRelease,
    /// The release carries nothing that can be downloaded.
    #[error("no downloadable update found in release")]
    ArtifactNotFound,
    /// Every extraction mechanism failed.
    #[error("failed to extract update: {0}")]
    Extraction(String),
    /// The requested backup does not exist in the catalog.
    #[error("backup not found: {0}")]
    BackupNotFound(String),
    /// A filesystem operation on a known path failed.
    #[error("filesystem operation on {} failed: {source}", path.display())]
    Filesystem {
        /// Path the operation was applied to.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] io::Error),
    /// Release metadata or a backup manifest could not be decoded.
    #[error("metadata decoding failed: {0}")]
    MetadataDecode(#[from] serde_json::Error),
    /// Another update or rollback holds the installation.
    #[error("installation is busy: {0}")]
    Busy(String),
    /// The updater configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        UpdaterError::Other(msg.into())
    }

    /// Returns a mapper that attaches `path` to an I/O error.
    ///
    /// ```ignore
    /// std::fs::copy(&from, &to).map_err(UpdaterError::fs(&to))?;
    /// ```
    pub fn fs(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> UpdaterError {
        let path = path.as_ref().to_path_buf();
        move |source| UpdaterError::Filesystem { path, source }
    }
}

impl From<reqwest::Error> for UpdaterError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|url| url.to_string())
            .unwrap_or_else(|| "request".to_string());
        if err.is_timeout() {
            UpdaterError::Timeout(url)
        } else {
            UpdaterError::Network(err.to_string())
        }
    }
}
