//! Configuration for the DeviceBox updater.
//!
//! Loads settings from /etc/devicebox/updater.toml or uses defaults, then
//! applies the environment overrides the appliance's install scripts set
//! (GITHUB_REPO, GITHUB_TOKEN, INSTALL_DIR, SERVICE_USER, APP_NAME).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/devicebox/updater.toml";

/// Environment variable naming an alternative config file
pub const CONFIG_ENV: &str = "DEVICEBOX_UPDATER_CONFIG";

/// Where the latest release is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// GitHub "latest release" API, archive from an asset or the zipball
    GithubRelease,
    /// Head commit of a branch, archive pinned to that commit
    BranchHead,
    /// Plain JSON manifest endpoint
    Manifest,
}

impl Default for SourceKind {
    fn default() -> Self {
        Self::GithubRelease
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// owner/name
    #[serde(default = "default_repo")]
    pub repo: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Base for commit archive URLs built by the branch_head source
    #[serde(default = "default_web_base")]
    pub web_base: String,

    /// Branch followed by the branch_head source
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Endpoint for the manifest source
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Only release assets whose name contains this are considered
    #[serde(default)]
    pub asset_pattern: Option<String>,

    /// API token for private repositories or higher rate limits
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout for release lookups
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_repo() -> String {
    "Musik-Wieland/DeviceBox".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_web_base() -> String {
    "https://github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_source_timeout() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            repo: default_repo(),
            api_base: default_api_base(),
            web_base: default_web_base(),
            branch: default_branch(),
            manifest_url: None,
            asset_pattern: None,
            token: None,
            timeout_secs: default_source_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Whole-transfer timeout for the release archive
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_download_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    15
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Live install path the service runs from
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Version record; kept outside install_dir
    #[serde(default = "default_version_file")]
    pub version_file: PathBuf,

    /// Download/extract area; must share a filesystem with install_dir
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Parent of per-transaction backup snapshots
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Paths (relative to install_dir) carried over from the old tree
    #[serde(default = "default_preserved_paths")]
    pub preserved_paths: Vec<PathBuf>,

    /// Files made executable after the swap
    #[serde(default = "default_executable_files")]
    pub executable_files: Vec<PathBuf>,

    /// Account the service runs as; the new tree is handed to it
    #[serde(default = "default_service_user")]
    pub service_user: Option<String>,

    /// Compare the restored tree against the pre-update digest on rollback
    #[serde(default = "default_true")]
    pub verify_rollback_digest: bool,
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/devicebox")
}

fn default_version_file() -> PathBuf {
    PathBuf::from("/var/lib/devicebox/version.json")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/opt/.devicebox-update")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/opt/.devicebox-backup")
}

fn default_preserved_paths() -> Vec<PathBuf> {
    ["data", "config.json", "devices.json", "logs", "venv"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_executable_files() -> Vec<PathBuf> {
    ["app.py", "device_manager.py"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_service_user() -> Option<String> {
    Some("pi".to_string())
}

fn default_true() -> bool {
    true
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            version_file: default_version_file(),
            scratch_dir: default_scratch_dir(),
            backup_dir: default_backup_dir(),
            preserved_paths: default_preserved_paths(),
            executable_files: default_executable_files(),
            service_user: default_service_user(),
            verify_rollback_digest: true,
        }
    }
}

impl InstallConfig {
    /// Where the old tree is parked during a swap: `<install_dir>_old`.
    pub fn aside_dir(&self) -> PathBuf {
        let mut name = self
            .install_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "install".into());
        name.push("_old");
        self.install_dir.with_file_name(name)
    }

    /// Committed aside trees are renamed here before deletion, so a kill
    /// during the delete never leaves a partial tree at `aside_dir`.
    pub fn discard_dir(&self) -> PathBuf {
        let mut path = self.aside_dir().into_os_string();
        path.push(".discard");
        PathBuf::from(path)
    }

    /// Version record of the tree parked at `aside_dir`, restored along
    /// with it when recovery moves the aside tree back.
    pub fn record_stash(&self) -> PathBuf {
        let mut path = self.aside_dir().into_os_string();
        path.push(".version.json");
        PathBuf::from(path)
    }
}

/// Process supervisor used to stop/start the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorKind {
    Systemd,
    /// No supervisor (development machines); the service counts as active
    None,
}

impl Default for SupervisorKind {
    fn default() -> Self {
        Self::Systemd
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default)]
    pub supervisor: SupervisorKind,

    /// Prefix supervisor commands with `sudo -n` when not running as root
    #[serde(default = "default_true")]
    pub use_sudo: bool,

    /// Timeout for each stop/start/is-active call
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,

    /// Liveness checks after a start
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_service_name() -> String {
    "devicebox".to_string()
}

fn default_service_timeout() -> u64 {
    30
}

fn default_poll_attempts() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    3
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            supervisor: SupervisorKind::default(),
            use_sudo: true,
            timeout_secs: default_service_timeout(),
            poll_attempts: default_poll_attempts(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Complete updater configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

impl UpdaterConfig {
    /// Load from an explicit path, `$DEVICEBOX_UPDATER_CONFIG`, or CONFIG_PATH,
    /// falling back to defaults when no file exists. Environment overrides and
    /// validation are applied in every case.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(CONFIG_PATH).exists() => Self::from_file(Path::new(CONFIG_PATH))?,
            None => {
                debug!("No config file at {}, using defaults", CONFIG_PATH);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(repo) = non_empty("GITHUB_REPO") {
            self.source.repo = repo;
        }
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.source.token = Some(token);
        }
        if let Some(dir) = non_empty("INSTALL_DIR") {
            self.install.install_dir = PathBuf::from(dir);
        }
        if let Some(user) = non_empty("SERVICE_USER") {
            self.install.service_user = Some(user);
        }
        if let Some(name) = non_empty("APP_NAME") {
            self.service.name = name;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for path in &self.install.preserved_paths {
            validate_relative(path, "preserved path")?;
        }
        for path in &self.install.executable_files {
            validate_relative(path, "executable file")?;
        }

        if self.service.poll_attempts == 0 {
            bail!("service.poll_attempts must be at least 1");
        }
        if self.service.timeout_secs == 0
            || self.source.timeout_secs == 0
            || self.download.timeout_secs == 0
        {
            bail!("timeouts must be non-zero");
        }
        if self.source.kind == SourceKind::Manifest && self.source.manifest_url.is_none() {
            bail!("source.manifest_url is required for the manifest source");
        }
        if self.source.kind != SourceKind::Manifest && !self.source.repo.contains('/') {
            bail!("source.repo must be owner/name, got {:?}", self.source.repo);
        }

        let install = &self.install.install_dir;
        for (label, dir) in [
            ("scratch_dir", &self.install.scratch_dir),
            ("backup_dir", &self.install.backup_dir),
        ] {
            if dir.starts_with(install) {
                bail!("{} must not be inside install_dir ({})", label, dir.display());
            }
        }
        if self.install.version_file.starts_with(install) {
            bail!("version_file must live outside install_dir");
        }
        Ok(())
    }
}

fn validate_relative(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("empty {}", what);
    }
    if !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("{} must be a plain relative path: {}", what, path.display());
    }
    Ok(())
}
