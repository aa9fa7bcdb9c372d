use crate::config::{DEFAULT_RELEASE_URL, DEFAULT_USER_AGENT};
use crate::error::{Result, UpdaterError};
use crate::http::{self, GetRequest};
use crate::version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";
const NO_NOTES: &str = "No release notes available.";

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Release metadata as published by the release endpoint.
///
/// Fetched fresh for every check and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    #[serde(default)]
    pub zipball_url: Option<String>,
    #[serde(default)]
    pub tarball_url: Option<String>,
}

impl ReleaseInfo {
    /// Raw tag of the release: `tag_name`, else `name`, else `0.0.0`.
    pub fn tag(&self) -> &str {
        [self.tag_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .find(|tag| !tag.trim().is_empty())
            .unwrap_or(version::FALLBACK_VERSION)
    }

    /// Tag with the leading `v` removed.
    pub fn version(&self) -> &str {
        version::strip_prefix(self.tag())
    }

    pub fn notes(&self) -> &str {
        self.body
            .as_deref()
            .filter(|body| !body.trim().is_empty())
            .unwrap_or(NO_NOTES)
    }
}

/// Outcome of comparing the published release with the running version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Nothing has been published yet. Not an error.
    NoReleases,
    /// The latest release is not newer than the running version.
    UpToDate(ReleaseInfo),
    /// A newer release is available.
    Available(ReleaseInfo),
}

impl UpdateCheck {
    pub fn is_available(&self) -> bool {
        matches!(self, UpdateCheck::Available(_))
    }

    pub fn release(&self) -> Option<&ReleaseInfo> {
        match self {
            UpdateCheck::NoReleases => None,
            UpdateCheck::UpToDate(release) | UpdateCheck::Available(release) => Some(release),
        }
    }
}

/// The file chosen for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// A pre-built archive attached to the release.
    Asset { name: String, url: String },
    /// The source archive generated for the release tag.
    SourceArchive { url: String },
}

impl Artifact {
    pub fn url(&self) -> &str {
        match self {
            Artifact::Asset { url, .. } | Artifact::SourceArchive { url } => url,
        }
    }
}

/// Chooses which release file to download.
///
/// First match wins: a keyword-bearing archive asset, then any archive asset,
/// then the release's source zipball.
#[derive(Debug, Clone)]
pub struct AssetSelector {
    suffix: String,
    keywords: Vec<String>,
}

impl AssetSelector {
    pub fn new(suffix: impl Into<String>, keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            suffix: suffix.into().to_ascii_lowercase(),
            keywords: keywords
                .into_iter()
                .map(|keyword| keyword.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn select(&self, release: &ReleaseInfo) -> Result<Artifact> {
        let archives: Vec<&ReleaseAsset> = release
            .assets
            .iter()
            .filter(|asset| asset.name.to_ascii_lowercase().ends_with(&self.suffix))
            .collect();

        let preferred = archives.iter().find(|asset| {
            let name = asset.name.to_ascii_lowercase();
            self.keywords.iter().any(|keyword| name.contains(keyword))
        });

        if let Some(asset) = preferred.or_else(|| archives.first()) {
            debug!(asset = %asset.name, "selected release asset");
            return Ok(Artifact::Asset {
                name: asset.name.clone(),
                url: asset.browser_download_url.clone(),
            });
        }

        match release.zipball_url.as_deref() {
            Some(url) if !url.is_empty() => {
                debug!("falling back to release source zipball");
                Ok(Artifact::SourceArchive {
                    url: url.to_string(),
                })
            }
            _ => Err(UpdaterError::ArtifactNotFound),
        }
    }
}

impl Default for AssetSelector {
    fn default() -> Self {
        let config = crate::config::UpdaterConfig::default();
        Self::new(config.archive_suffix, config.asset_keywords)
    }
}

/// Select the artifact of `release` with the default archive rules.
pub fn select_artifact(release: &ReleaseInfo) -> Result<Artifact> {
    AssetSelector::default().select(release)
}

/// Abstraction over the remote release metadata endpoint.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the latest release; `Ok(None)` means nothing is published.
    async fn latest_release(&self) -> Result<Option<ReleaseInfo>>;
}

/// Compare the latest published release with `current_version`.
pub async fn check_for_updates<S>(source: &S, current_version: &str) -> Result<UpdateCheck>
where
    S: ReleaseSource + ?Sized,
{
    let Some(release) = source.latest_release().await? else {
        info!("no releases published");
        return Ok(UpdateCheck::NoReleases);
    };

    if version::is_newer(current_version, release.tag()) {
        info!(current = current_version, latest = release.version(), "update available");
        Ok(UpdateCheck::Available(release))
    } else {
        info!(current = current_version, latest = release.version(), "already up to date");
        Ok(UpdateCheck::UpToDate(release))
    }
}

/// Builder for [`GithubReleaseClient`].
#[derive(Default)]
pub struct GithubReleaseClientBuilder {
    url: Option<Url>,
    client: Option<Client>,
    user_agent: Option<String>,
    timeout: Option<Duration>,
}

impl GithubReleaseClientBuilder {
    /// Set the release metadata URL (e.g. `https://api.github.com/repos/o/r/releases/latest`).
    pub fn release_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Provide a custom reqwest client instance. It must not follow redirects itself.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<GithubReleaseClient> {
        let url = match self.url {
            Some(url) => url,
            None => Url::parse(DEFAULT_RELEASE_URL)
                .map_err(|err| UpdaterError::Config(format!("invalid release URL: {err}")))?,
        };
        let client = match self.client {
            Some(client) => client,
            None => http::client()?,
        };

        Ok(GithubReleaseClient {
            url,
            client,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout: self.timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

/// Release source backed by the GitHub "latest release" endpoint.
#[derive(Clone)]
pub struct GithubReleaseClient {
    url: Url,
    client: Client,
    user_agent: String,
    timeout: Duration,
}

impl GithubReleaseClient {
    /// Create a new builder.
    pub fn builder() -> GithubReleaseClientBuilder {
        GithubReleaseClientBuilder::default()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseClient {
    async fn latest_release(&self) -> Result<Option<ReleaseInfo>> {
        debug!(url = %self.url, "fetching release metadata");
        let response = http::get(
            &self.client,
            self.url.as_str(),
            GetRequest {
                user_agent: &self.user_agent,
                accept: Some(GITHUB_ACCEPT),
                timeout: self.timeout,
            },
        )
        .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            status => {
                return Err(UpdaterError::Status {
                    url: response.url().to_string(),
                    status,
                })
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| http::transport_error(err, &self.url))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn asset(name: &str) -> ReleaseAsset {
        ReleaseAsset {
            name: name.to_string(),
            browser_download_url: format!("https://downloads.example/{name}"),
            size: None,
        }
    }

    fn release_with(assets: Vec<ReleaseAsset>, zipball: Option<&str>) -> ReleaseInfo {
        ReleaseInfo {
            tag_name: Some("v5.2.0".into()),
            assets,
            zipball_url: zipball.map(String::from),
            ..ReleaseInfo::default()
        }
    }

    #[test]
    fn prefers_keyword_archive() {
        let release = release_with(
            vec![asset("readme.txt"), asset("gcsd-win.zip")],
            Some("https://api.example/zipball/v5.2.0"),
        );
        let artifact = select_artifact(&release).unwrap();
        assert_eq!(
            artifact,
            Artifact::Asset {
                name: "gcsd-win.zip".into(),
                url: "https://downloads.example/gcsd-win.zip".into(),
            }
        );
    }

    #[test]
    fn keyword_archive_beats_earlier_plain_archive() {
        let release = release_with(vec![asset("other.zip"), asset("Inventory-Desktop.ZIP")], None);
        match select_artifact(&release).unwrap() {
            Artifact::Asset { name, .. } => assert_eq!(name, "Inventory-Desktop.ZIP"),
            other => panic!("unexpected artifact {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_any_archive() {
        let release = release_with(vec![asset("other.zip")], Some("https://api.example/zipball"));
        match select_artifact(&release).unwrap() {
            Artifact::Asset { name, .. } => assert_eq!(name, "other.zip"),
            other => panic!("unexpected artifact {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_zipball() {
        let release = release_with(vec![], Some("https://api.example/zipball/v5.2.0"));
        assert_eq!(
            select_artifact(&release).unwrap(),
            Artifact::SourceArchive {
                url: "https://api.example/zipball/v5.2.0".into()
            }
        );
    }

    #[test]
    fn nothing_to_download() {
        let release = release_with(vec![asset("notes.txt")], None);
        assert!(matches!(
            select_artifact(&release),
            Err(UpdaterError::ArtifactNotFound)
        ));
    }

    #[test]
    fn tag_falls_back_to_name_then_zero() {
        let mut release = ReleaseInfo {
            name: Some("v6.0.1".into()),
            ..ReleaseInfo::default()
        };
        assert_eq!(release.version(), "6.0.1");
        release.name = None;
        assert_eq!(release.tag(), "0.0.0");
        assert_eq!(release.notes(), NO_NOTES);
    }

    fn client_for(server: &MockServer) -> GithubReleaseClient {
        GithubReleaseClient::builder()
            .release_url(Url::parse(&format!("{}/repos/o/r/releases/latest", server.uri())).unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn not_found_means_no_releases() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/releases/latest"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;

        let check = check_for_updates(&client_for(&server), "5.1.0").await.unwrap();
        assert_eq!(check, UpdateCheck::NoReleases);
    }

    #[tokio::test]
    async fn other_failure_statuses_are_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = check_for_updates(&client_for(&server), "5.1.0").await.unwrap_err();
        assert!(
            matches!(err, UpdaterError::Status { status, .. } if status == StatusCode::FORBIDDEN),
            "{err}"
        );
    }

    #[tokio::test]
    async fn newer_tag_is_available() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/o/r/releases/latest"))
            .and(header("accept", GITHUB_ACCEPT))
            .and(header("user-agent", DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tag_name": "v5.2.0",
                "published_at": "2026-01-05T10:00:00Z",
                "body": "Bug fixes",
                "html_url": "https://github.com/o/r/releases/tag/v5.2.0",
                "assets": [{"name": "gcsd-win.zip", "browser_download_url": "https://dl/gcsd-win.zip"}],
                "zipball_url": "https://api/zipball/v5.2.0",
                "tarball_url": "https://api/tarball/v5.2.0"
            })))
            .mount(&server)
            .await;

        let check = check_for_updates(&client_for(&server), "5.1.0").await.unwrap();
        let UpdateCheck::Available(release) = check else {
            panic!("expected an available update");
        };
        assert_eq!(release.version(), "5.2.0");
        assert_eq!(release.notes(), "Bug fixes");
        assert_eq!(release.assets.len(), 1);

        let same = check_for_updates(&client_for(&server), "v5.2.0").await.unwrap();
        assert!(matches!(same, UpdateCheck::UpToDate(_)));
    }
}
