//! Release Resolver - find the latest published DeviceBox build.
//!
//! Three sources are supported:
//! - `github_release`: GitHub "latest release" API. The archive is the first
//!   `.zip`/`.tar.gz` asset (optionally filtered by name), else the zipball.
//! - `branch_head`: head commit of a branch. The archive URL is pinned to the
//!   commit SHA so a push between resolve and fetch cannot change it.
//! - `manifest`: a plain JSON document with version, URL and notes.
//!
//! Resolution never touches the filesystem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devicebox_common::config::{SourceConfig, SourceKind};
use devicebox_common::{is_update_available, BuildVersion, UpdateError, VERSION};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One published build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub version: BuildVersion,
    /// Where the release archive can be downloaded
    pub fetch_location: String,
    pub published_at: Option<DateTime<Utc>>,
    pub notes: String,
    /// Tag name or commit SHA as reported by the source
    pub source_identifier: String,
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Short label for logs
    fn describe(&self) -> String;

    async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError>;
}

/// Resolves releases through a configured [`ReleaseSource`].
pub struct ReleaseResolver {
    source: Box<dyn ReleaseSource>,
}

impl ReleaseResolver {
    pub fn new(source: Box<dyn ReleaseSource>) -> Self {
        Self { source }
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, UpdateError> {
        Ok(Self::new(source_for_config(config)?))
    }

    pub async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        debug!("Resolving latest release from {}", self.source.describe());
        let release = self.source.latest().await?;
        info!(
            "Latest release: {} ({})",
            release.version, release.source_identifier
        );
        Ok(release)
    }

    pub fn is_update_available(current: Option<&BuildVersion>, latest: &ReleaseDescriptor) -> bool {
        is_update_available(current, &latest.version)
    }
}

/// Build the source selected by config.
pub fn source_for_config(config: &SourceConfig) -> Result<Box<dyn ReleaseSource>, UpdateError> {
    let client = api_client(config)?;
    let api_base = config.api_base.trim_end_matches('/').to_string();

    Ok(match config.kind {
        SourceKind::GithubRelease => Box::new(GithubReleaseSource {
            client,
            url: format!("{}/repos/{}/releases/latest", api_base, config.repo),
            asset_pattern: config.asset_pattern.clone(),
        }),
        SourceKind::BranchHead => Box::new(BranchHeadSource {
            client,
            url: format!("{}/repos/{}/commits/{}", api_base, config.repo, config.branch),
            archive_base: format!("{}/{}", config.web_base.trim_end_matches('/'), config.repo),
        }),
        SourceKind::Manifest => {
            let url = config
                .manifest_url
                .clone()
                .ok_or_else(|| UpdateError::Config("manifest source needs manifest_url".into()))?;
            Box::new(ManifestSource { client, url })
        }
    })
}

fn api_client(config: &SourceConfig) -> Result<reqwest::Client, UpdateError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github.v3+json"));
    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("token {}", token))
            .map_err(|_| UpdateError::Config("token contains invalid characters".into()))?;
        headers.insert(AUTHORIZATION, value);
    }
    let agent = HeaderValue::from_str(&format!("devicebox-updater/{}", VERSION))
        .map_err(|e| UpdateError::Config(e.to_string()))?;
    headers.insert(USER_AGENT, agent);

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.timeout())
        .build()
        .map_err(|e| UpdateError::Config(format!("HTTP client: {}", e)))
}

/// GET `url` and return the body, mapping HTTP failures onto the taxonomy.
async fn get_text(client: &reqwest::Client, url: &str) -> Result<String, UpdateError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| UpdateError::SourceUnreachable(format!("{}: {}", url, e)))?;

    let status = response.status();
    if let Some(err) = status_error(status, url) {
        return Err(err);
    }

    response
        .text()
        .await
        .map_err(|e| UpdateError::SourceUnreachable(format!("reading {}: {}", url, e)))
}

fn status_error(status: StatusCode, url: &str) -> Option<UpdateError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND => UpdateError::NoReleases,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            UpdateError::SourceUnreachable(format!(
                "HTTP {} from {} (unauthorized or rate limited)",
                status.as_u16(),
                url
            ))
        }
        _ => UpdateError::SourceUnreachable(format!("HTTP {} from {}", status.as_u16(), url)),
    })
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            debug!("Ignoring unparseable timestamp {:?}: {}", raw, e);
            None
        }
    }
}

fn parse_version(raw: &str) -> Result<BuildVersion, UpdateError> {
    BuildVersion::parse(raw)
        .map_err(|e| UpdateError::SourceMalformed(format!("version {:?}: {}", raw, e)))
}

fn is_archive_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".zip") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}

// ---------------------------------------------------------------------------
// github_release
// ---------------------------------------------------------------------------

pub struct GithubReleaseSource {
    client: reqwest::Client,
    url: String,
    asset_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    zipball_url: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Parse a GitHub release object into a descriptor.
pub fn parse_github_release(
    body: &str,
    asset_pattern: Option<&str>,
) -> Result<ReleaseDescriptor, UpdateError> {
    let malformed = |e: serde_json::Error| UpdateError::SourceMalformed(e.to_string());
    // A release list (newest first) is accepted as well as a single release
    let release: GithubRelease = if body.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<GithubRelease>>(body)
            .map_err(malformed)?
            .into_iter()
            .next()
            .ok_or(UpdateError::NoReleases)?
    } else {
        serde_json::from_str(body).map_err(malformed)?
    };

    let tag = release
        .tag_name
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| UpdateError::SourceMalformed("release has no tag_name".into()))?;
    let version = parse_version(&tag)?;

    let asset = release.assets.iter().find(|a| {
        is_archive_name(&a.name) && asset_pattern.map_or(true, |p| a.name.contains(p))
    });
    let fetch_location = match (asset, release.zipball_url) {
        (Some(asset), _) => asset.browser_download_url.clone(),
        (None, Some(zipball)) => zipball,
        (None, None) => {
            return Err(UpdateError::SourceMalformed(format!(
                "release {} has no downloadable archive",
                tag
            )))
        }
    };

    Ok(ReleaseDescriptor {
        version,
        fetch_location,
        published_at: parse_timestamp(release.published_at.as_deref()),
        notes: release.body.unwrap_or_default(),
        source_identifier: tag,
    })
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    fn describe(&self) -> String {
        format!("github_release {}", self.url)
    }

    async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        let body = get_text(&self.client, &self.url).await?;
        parse_github_release(&body, self.asset_pattern.as_deref())
    }
}

// ---------------------------------------------------------------------------
// branch_head
// ---------------------------------------------------------------------------

pub struct BranchHeadSource {
    client: reqwest::Client,
    url: String,
    /// `https://github.com/owner/name`
    archive_base: String,
}

#[derive(Debug, Deserialize)]
struct GithubCommit {
    sha: Option<String>,
    commit: Option<CommitDetail>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
    committer: Option<CommitSignature>,
}

#[derive(Debug, Deserialize)]
struct CommitSignature {
    date: Option<String>,
}

/// Parse a GitHub commit object. The build identity is the full SHA.
pub fn parse_branch_head(body: &str, archive_base: &str) -> Result<ReleaseDescriptor, UpdateError> {
    let head: GithubCommit =
        serde_json::from_str(body).map_err(|e| UpdateError::SourceMalformed(e.to_string()))?;

    let sha = head
        .sha
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| UpdateError::SourceMalformed("commit has no valid sha".into()))?;

    let (notes, date) = match head.commit {
        Some(detail) => (detail.message, detail.committer.and_then(|c| c.date)),
        None => (String::new(), None),
    };

    Ok(ReleaseDescriptor {
        version: BuildVersion::Revision(sha.clone()),
        fetch_location: format!("{}/archive/{}.zip", archive_base.trim_end_matches('/'), sha),
        published_at: parse_timestamp(date.as_deref()),
        notes,
        source_identifier: sha,
    })
}

#[async_trait]
impl ReleaseSource for BranchHeadSource {
    fn describe(&self) -> String {
        format!("branch_head {}", self.url)
    }

    async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        let body = get_text(&self.client, &self.url).await?;
        parse_branch_head(&body, &self.archive_base)
    }
}

// ---------------------------------------------------------------------------
// manifest
// ---------------------------------------------------------------------------

pub struct ManifestSource {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(alias = "tag_or_version", alias = "tag_name", alias = "tag")]
    version: Option<String>,
    #[serde(alias = "url", alias = "download_url")]
    archive_url: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default, alias = "body", alias = "changelog")]
    notes: Option<String>,
}

/// Parse a JSON manifest: `{"tag_or_version", "archive_url", "published_at", "notes"}`.
pub fn parse_manifest(body: &str) -> Result<ReleaseDescriptor, UpdateError> {
    let manifest: Manifest =
        serde_json::from_str(body).map_err(|e| UpdateError::SourceMalformed(e.to_string()))?;

    let raw_version = manifest
        .version
        .filter(|v| !v.trim().is_empty())
        .ok_or(UpdateError::NoReleases)?;
    let version = parse_version(&raw_version)?;

    let fetch_location = manifest
        .archive_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| UpdateError::SourceMalformed("manifest has no archive_url".into()))?;

    Ok(ReleaseDescriptor {
        version,
        fetch_location,
        published_at: parse_timestamp(manifest.published_at.as_deref()),
        notes: manifest.notes.unwrap_or_default(),
        source_identifier: raw_version,
    })
}

#[async_trait]
impl ReleaseSource for ManifestSource {
    fn describe(&self) -> String {
        format!("manifest {}", self.url)
    }

    async fn latest(&self) -> Result<ReleaseDescriptor, UpdateError> {
        let body = get_text(&self.client, &self.url).await?;
        parse_manifest(&body)
    }
}
