//! Artifact Fetcher - download and unpack a release into scratch space.
//!
//! Nothing under the live install path is touched here. The archive is
//! streamed into a private working directory under `scratch_dir`, unpacked
//! next to it, and deleted; the working directory goes away when the
//! returned [`StagedRelease`] is dropped.

use async_trait::async_trait;
use devicebox_common::config::{DownloadConfig, InstallConfig};
use devicebox_common::{UpdateError, VERSION};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::archive;
use crate::resolver::ReleaseDescriptor;

/// A release unpacked in scratch space, ready to be swapped in.
#[derive(Debug)]
pub struct StagedRelease {
    workdir: TempDir,
    root: PathBuf,
    release: ReleaseDescriptor,
}

impl StagedRelease {
    /// `root` must live inside `workdir`.
    pub fn new(workdir: TempDir, root: PathBuf, release: ReleaseDescriptor) -> Self {
        Self {
            workdir,
            root,
            release,
        }
    }

    /// Top-level directory of the unpacked release
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn release(&self) -> &ReleaseDescriptor {
        &self.release
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, release: &ReleaseDescriptor) -> Result<StagedRelease, UpdateError>;
}

/// Downloads over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
    scratch_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(download: &DownloadConfig, install: &InstallConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("devicebox-updater/{}", VERSION))
            .connect_timeout(download.connect_timeout())
            .timeout(download.timeout())
            .build()
            .map_err(|e| UpdateError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            scratch_dir: install.scratch_dir.clone(),
        })
    }

    /// Stream `url` into `dest`. Returns the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::DownloadFailed(format!(
                "HTTP {} from {}",
                status.as_u16(),
                url
            )));
        }

        let expected = response.content_length();
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;

        let mut received: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("reading body: {}", e)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;
            received += chunk.len() as u64;
        }
        file.sync_all()
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("{}: {}", dest.display(), e)))?;

        if let Some(expected) = expected {
            if received != expected {
                return Err(UpdateError::DownloadFailed(format!(
                    "truncated download: got {} of {} bytes",
                    received, expected
                )));
            }
        }
        if received == 0 {
            return Err(UpdateError::DownloadFailed("empty download".into()));
        }
        Ok(received)
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, release: &ReleaseDescriptor) -> Result<StagedRelease, UpdateError> {
        fs::create_dir_all(&self.scratch_dir).await.map_err(|e| {
            UpdateError::DownloadFailed(format!("{}: {}", self.scratch_dir.display(), e))
        })?;
        let workdir = tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| {
                UpdateError::DownloadFailed(format!("{}: {}", self.scratch_dir.display(), e))
            })?;

        let archive_path = workdir.path().join("release.archive");
        info!("Downloading {} from {}", release.version, release.fetch_location);
        let bytes = self.download(&release.fetch_location, &archive_path).await?;
        debug!("Downloaded {} bytes", bytes);

        let extract_dir = workdir.path().join("extracted");
        let root = tokio::task::spawn_blocking(move || {
            let result = archive::extract(&archive_path, &extract_dir);
            if let Err(e) = std::fs::remove_file(&archive_path) {
                warn!("Could not remove {}: {}", archive_path.display(), e);
            }
            result
        })
        .await
        .map_err(|e| UpdateError::ExtractFailed(format!("extraction task: {}", e)))??;

        info!("Staged {} at {}", release.version, root.display());
        Ok(StagedRelease::new(workdir, root, release.clone()))
    }
}
