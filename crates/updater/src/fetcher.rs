use crate::error::{Result, UpdaterError};
use crate::http::{self, GetRequest};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Byte progress of a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.downloaded.min(self.total) * 100) / self.total) as u8
    }
}

/// Sender half used to observe download progress.
///
/// Notifications are only sent when the server advertises a size. The
/// receiver must be drained concurrently with the download.
pub type ProgressSender = mpsc::Sender<DownloadProgress>;

/// A download that completed and was moved into place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the bytes written. Informational only.
    pub sha256: String,
}

/// Abstraction over retrieving an artifact onto disk.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Stream `url` into `destination`.
    ///
    /// On failure `destination` is left untouched and no partial file remains.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<FetchedArtifact>;
}

/// Streams artifacts over HTTP(S).
#[derive(Clone)]
pub struct HttpArtifactFetcher {
    client: Client,
    user_agent: String,
    timeout: Duration,
}

impl HttpArtifactFetcher {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self::with_client(http::client()?, user_agent, timeout))
    }

    /// Use an existing client. It must not follow redirects itself.
    pub fn with_client(client: Client, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressSender>,
    ) -> Result<FetchedArtifact> {
        let response = http::get(
            &self.client,
            url,
            GetRequest {
                user_agent: &self.user_agent,
                accept: None,
                timeout: self.timeout,
            },
        )
        .await?;

        if response.status() != StatusCode::OK {
            return Err(UpdaterError::Status {
                url: response.url().to_string(),
                status: response.status(),
            });
        }

        let final_url: Url = response.url().clone();
        let total = response.content_length().filter(|len| *len > 0);
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(UpdaterError::fs(parent))?;

        // Dropping the temp file on any early return removes the partial download.
        let mut partial = NamedTempFile::new_in(parent).map_err(UpdaterError::fs(parent))?;
        let mut hasher = Sha256::new();
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        info!(%url, total = ?total, destination = %destination.display(), "downloading artifact");
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(|err| http::transport_error(err, &final_url))?;
            partial
                .write_all(&chunk)
                .map_err(UpdaterError::fs(partial.path()))?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let (Some(total), Some(progress)) = (total, progress.as_ref()) {
                // A dropped receiver only means nobody is watching.
                let _ = progress.send(DownloadProgress { downloaded, total }).await;
            }
        }

        if let Some(total) = total {
            if downloaded < total {
                return Err(UpdaterError::Network(format!(
                    "download of {url} ended after {downloaded} of {total} bytes"
                )));
            }
        }

        partial.flush().map_err(UpdaterError::fs(partial.path()))?;
        partial
            .as_file()
            .sync_all()
            .map_err(UpdaterError::fs(partial.path()))?;
        partial
            .persist(destination)
            .map_err(|err| UpdaterError::fs(destination)(err.error))?;

        debug!(bytes = downloaded, "download complete");
        Ok(FetchedArtifact {
            path: destination.to_path_buf(),
            bytes: downloaded,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(timeout: Duration) -> HttpArtifactFetcher {
        HttpArtifactFetcher::new("test-agent", timeout).unwrap()
    }

    fn collect(mut rx: mpsc::Receiver<DownloadProgress>) -> tokio::task::JoinHandle<Vec<DownloadProgress>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(update) = rx.recv().await {
                seen.push(update);
            }
            seen
        })
    }

    #[tokio::test]
    async fn streams_body_to_destination_with_progress() {
        let server = MockServer::start().await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        Mock::given(method("GET"))
            .and(path("/update.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let destination = dir.path().join("update.zip");
        let (tx, rx) = mpsc::channel(8);
        let collector = collect(rx);

        let fetched = fetcher(Duration::from_secs(10))
            .download(&format!("{}/update.zip", server.uri()), &destination, Some(tx))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        assert_eq!(fetched.bytes, payload.len() as u64);
        assert_eq!(fetched.sha256, hex::encode(Sha256::digest(&payload)));

        let seen = collector.await.unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));
        let last = seen.last().unwrap();
        assert_eq!(last.downloaded, payload.len() as u64);
        assert_eq!(last.total, payload.len() as u64);
        assert_eq!(last.percent(), 100);
    }

    #[tokio::test]
    async fn empty_body_reports_no_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let destination = dir.path().join("empty.zip");
        let (tx, rx) = mpsc::channel(8);
        let collector = collect(rx);

        let fetched = fetcher(Duration::from_secs(10))
            .download(&server.uri(), &destination, Some(tx))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, 0);
        assert!(collector.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_status_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let destination = dir.path().join("update.zip");
        let err = fetcher(Duration::from_secs(10))
            .download(&server.uri(), &destination, None)
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Status { .. }), "{err}");
        assert!(!destination.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn timeout_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![7u8; 1024])
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let destination = dir.path().join("update.zip");
        let err = fetcher(Duration::from_millis(100))
            .download(&server.uri(), &destination, None)
            .await
            .unwrap_err();

        assert!(matches!(err, UpdaterError::Timeout(_)), "{err}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn percent_is_clamped() {
        let progress = DownloadProgress {
            downloaded: 150,
            total: 100,
        };
        assert_eq!(progress.percent(), 100);
        assert_eq!(
            DownloadProgress {
                downloaded: 1,
                total: 0
            }
            .percent(),
            0
        );
    }
}
