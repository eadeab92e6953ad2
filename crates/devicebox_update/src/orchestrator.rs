//! Update Orchestrator - the command surface of the engine.
//!
//! `check()` and `apply()` never return `Err`: every failure comes back as a
//! tagged outcome carrying an [`ErrorKind`] and a message, ready to be
//! serialized for whoever asked. At most one `apply()` runs at a time; a
//! second caller is turned away with `UpdateInProgress` rather than queued.

use chrono::{DateTime, Utc};
use devicebox_common::{BuildVersion, ErrorKind, UpdateError, UpdaterConfig, VersionRecord};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::fetcher::{ArtifactFetcher, HttpFetcher};
use crate::resolver::ReleaseResolver;
use crate::transaction::{
    recover_interrupted, InstallContext, InstallationState, RecoveryReport, StateHandle,
    Transaction,
};

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub available: bool,
    pub current: Option<String>,
    pub latest: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub message: String,
    pub error: Option<ErrorKind>,
}

impl CheckOutcome {
    fn failed(current: Option<&BuildVersion>, err: &UpdateError) -> Self {
        Self {
            available: false,
            current: current.map(ToString::to_string),
            latest: None,
            published_at: None,
            notes: None,
            message: err.to_string(),
            error: Some(err.kind()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub success: bool,
    pub message: String,
    pub previous_version: Option<String>,
    pub new_version: Option<String>,
    pub state: InstallationState,
    pub error: Option<ErrorKind>,
    /// Snapshot left behind by a failed rollback
    pub backup_path: Option<PathBuf>,
}

impl ApplyOutcome {
    fn failed(previous: Option<&BuildVersion>, state: InstallationState, err: UpdateError) -> Self {
        let backup_path = match &err {
            UpdateError::RollbackFailed { backup, .. } => backup.clone(),
            _ => None,
        };
        Self {
            success: false,
            message: err.to_string(),
            previous_version: previous.map(ToString::to_string),
            new_version: None,
            state,
            error: Some(err.kind()),
            backup_path,
        }
    }

    /// 0 on success, 2 when the device needs an operator, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.error {
            None => 0,
            Some(ErrorKind::RollbackFailed) => 2,
            Some(ErrorKind::Config) => 64,
            Some(_) => 1,
        }
    }
}

pub struct UpdateOrchestrator {
    resolver: ReleaseResolver,
    fetcher: Arc<dyn ArtifactFetcher>,
    ctx: InstallContext,
    state: StateHandle,
    flight: Mutex<()>,
}

impl UpdateOrchestrator {
    pub fn new(
        resolver: ReleaseResolver,
        fetcher: Arc<dyn ArtifactFetcher>,
        ctx: InstallContext,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            ctx,
            state: StateHandle::default(),
            flight: Mutex::new(()),
        }
    }

    /// Wire up the real resolver, HTTP fetcher, filesystem and supervisor.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        let resolver = ReleaseResolver::from_config(&config.source)?;
        let fetcher = Arc::new(HttpFetcher::new(&config.download, &config.install)?);
        Ok(Self::new(resolver, fetcher, InstallContext::from_config(config)))
    }

    pub fn state(&self) -> InstallationState {
        self.state.get()
    }

    /// Installed version record, if any.
    pub fn installed(&self) -> Result<Option<VersionRecord>, UpdateError> {
        self.ctx
            .store
            .current()
            .map_err(|e| UpdateError::Corrupt(e.to_string()))
    }

    /// Compare the installed build against the latest release. Read-only.
    pub async fn check(&self) -> CheckOutcome {
        let current = self.ctx.store.current_version();
        let release = match self.resolver.latest().await {
            Ok(release) => release,
            Err(e) => {
                warn!("Update check failed: {}", e);
                return CheckOutcome::failed(current.as_ref(), &e);
            }
        };

        let available = ReleaseResolver::is_update_available(current.as_ref(), &release);
        let message = match (&current, available) {
            (_, false) => "Already up to date".to_string(),
            (Some(cur), true) => format!("Update available: {} -> {}", cur, release.version),
            (None, true) => format!(
                "Update available: {} (installed version unknown)",
                release.version
            ),
        };
        info!("{}", message);

        CheckOutcome {
            available,
            current: current.map(|v| v.to_string()),
            latest: Some(release.version.to_string()),
            published_at: release.published_at,
            notes: Some(release.notes),
            message,
            error: None,
        }
    }

    /// Install the latest release if it is newer than the installed one.
    pub async fn apply(&self) -> ApplyOutcome {
        let Ok(_guard) = self.flight.try_lock() else {
            warn!("Update requested while another is in progress");
            return ApplyOutcome::failed(None, self.state.get(), UpdateError::UpdateInProgress);
        };
        self.state.set(InstallationState::Idle);

        if let Err(e) = recover_interrupted(&self.ctx).await {
            error!("Recovery of an interrupted update failed: {}", e);
            self.state.set(InstallationState::Failed);
            return ApplyOutcome::failed(None, InstallationState::Failed, e);
        }

        let previous = self.ctx.store.current_version();
        let release = match self.resolver.latest().await {
            Ok(release) => release,
            Err(e) => return ApplyOutcome::failed(previous.as_ref(), self.state.get(), e),
        };

        if !ReleaseResolver::is_update_available(previous.as_ref(), &release) {
            info!("Already up to date ({})", release.version);
            return ApplyOutcome {
                success: true,
                message: "Already up to date".to_string(),
                previous_version: previous.as_ref().map(ToString::to_string),
                new_version: previous.as_ref().map(ToString::to_string),
                state: self.state.get(),
                error: None,
                backup_path: None,
            };
        }

        let txn = Transaction::new(&self.ctx, self.state.clone());
        match txn.run(self.fetcher.as_ref(), &release).await {
            Ok(report) => ApplyOutcome {
                success: true,
                message: format!(
                    "Updated {} -> {}",
                    previous
                        .as_ref()
                        .map_or_else(|| "unknown".to_string(), ToString::to_string),
                    report.record.version
                ),
                previous_version: previous.as_ref().map(ToString::to_string),
                new_version: Some(report.record.version.to_string()),
                state: self.state.get(),
                error: None,
                backup_path: None,
            },
            Err(e) => ApplyOutcome::failed(previous.as_ref(), self.state.get(), e),
        }
    }

    /// Undo leftovers of a killed update. Fails with `UpdateInProgress`
    /// while `apply()` is running.
    pub async fn recover(&self) -> Result<RecoveryReport, UpdateError> {
        let Ok(_guard) = self.flight.try_lock() else {
            return Err(UpdateError::UpdateInProgress);
        };
        recover_interrupted(&self.ctx).await
    }

    pub async fn check_for_update(&self) -> CheckOutcome {
        self.check().await
    }

    pub async fn perform_update(&self) -> ApplyOutcome {
        self.apply().await
    }
}
