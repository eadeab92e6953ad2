//! Installation Transaction - atomically replace the live install tree.
//!
//! Steps, in order:
//! 1. snapshot: full copy of the live tree to `backup_dir/<txn id>`
//! 2. stash the version record, stop the service, record the pre-update digest
//! 3. rename live -> `<install_dir>_old`, rename staged -> live
//! 4. copy the preserved paths back from the aside tree
//! 5. ownership and executable bits
//! 6. start the service and poll until it reports active
//! 7. record the new version
//!
//! Any failure from step 1 on ends in a rollback: a new build that was
//! already started is stopped, the aside tree is renamed back (or, if that
//! fails, the snapshot is copied back) and the service is started again. Only when that also fails is `RollbackFailed` reported,
//! and the snapshot is then left in place for the operator.

use devicebox_common::config::{InstallConfig, UpdaterConfig};
use devicebox_common::fsops::{FsError, FsOp};
use devicebox_common::{
    tree_digest, FileSystem, LocalFs, UpdateError, VersionRecord, VersionStore, VersionStoreError,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fetcher::{ArtifactFetcher, StagedRelease};
use crate::resolver::ReleaseDescriptor;
use crate::retry::{poll_until, PollBudget, PollOutcome};
use crate::service::{self, ServiceController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstallationState {
    #[default]
    Idle,
    Downloading,
    Staged,
    Swapping,
    RestoringData,
    Verifying,
    Committed,
    RolledBack,
    Failed,
}

impl InstallationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallationState::Committed | InstallationState::RolledBack | InstallationState::Failed
        )
    }
}

/// Observable phase of the current (or last) transaction.
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<RwLock<InstallationState>>);

impl StateHandle {
    pub fn get(&self) -> InstallationState {
        *self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set(&self, state: InstallationState) {
        *self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// Everything a transaction operates on.
pub struct InstallContext {
    pub install: InstallConfig,
    pub store: VersionStore,
    pub fs: Arc<dyn FileSystem>,
    pub service: Arc<dyn ServiceController>,
    /// Liveness checks after each start
    pub liveness: PollBudget,
}

impl InstallContext {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            install: config.install.clone(),
            store: VersionStore::new(&config.install.version_file),
            fs: Arc::new(LocalFs),
            service: service::for_config(&config.service),
            liveness: PollBudget::new(config.service.poll_attempts, config.service.poll_interval()),
        }
    }

    /// Poll the service until active or the budget runs out.
    pub async fn await_active(&self) -> Result<(), UpdateError> {
        let service = self.service.as_ref();
        match poll_until(self.liveness, move || service.is_active()).await {
            PollOutcome::Ready { attempts } => {
                debug!("{} active after {} checks", service.name(), attempts);
                Ok(())
            }
            PollOutcome::TimedOut { attempts } => Err(UpdateError::ServiceDidNotBecomeActive {
                service: service.name().to_string(),
                attempts,
            }),
        }
    }
}

/// Result of a committed transaction
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub transaction_id: Uuid,
    pub record: VersionRecord,
}

/// How far the swap got, consulted by rollback.
#[derive(Debug, Default)]
struct Progress {
    service_stopped: bool,
    live_moved_aside: bool,
    /// A start of the new tree was attempted
    service_started: bool,
}

pub struct Transaction<'a> {
    id: Uuid,
    ctx: &'a InstallContext,
    state: StateHandle,
    progress: Progress,
    snapshot: PathBuf,
    baseline_digest: Option<String>,
}

impl<'a> Transaction<'a> {
    pub fn new(ctx: &'a InstallContext, state: StateHandle) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            ctx,
            state,
            progress: Progress::default(),
            snapshot: ctx.install.backup_dir.join(id.to_string()),
            baseline_digest: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn enter(&self, state: InstallationState) {
        debug!(txn = %self.id, "-> {:?}", state);
        self.state.set(state);
    }

    fn fail(&self, err: UpdateError) -> UpdateError {
        error!(txn = %self.id, "Update failed: {}", err);
        self.enter(InstallationState::Failed);
        err
    }

    /// Fetch `release` and install it.
    pub async fn run(
        self,
        fetcher: &dyn ArtifactFetcher,
        release: &ReleaseDescriptor,
    ) -> Result<CommitReport, UpdateError> {
        info!(txn = %self.id, "Installing {}", release.version);
        self.enter(InstallationState::Downloading);
        let staged = match fetcher.fetch(release).await {
            Ok(staged) => staged,
            Err(e) => return Err(self.fail(e)),
        };
        self.enter(InstallationState::Staged);
        self.install(staged).await
    }

    /// Swap an already staged release into place. The scratch working
    /// directory is removed when this returns, whatever the outcome.
    pub async fn install(mut self, staged: StagedRelease) -> Result<CommitReport, UpdateError> {
        if let Err(e) = self.take_snapshot() {
            if let Err(cleanup) = self.ctx.fs.remove_tree(&self.snapshot) {
                warn!("Could not remove partial snapshot: {}", cleanup);
            }
            return Err(self.fail(UpdateError::SnapshotFailed(e)));
        }

        match self.swap_in(&staged).await {
            Ok(record) => {
                self.commit();
                Ok(CommitReport {
                    transaction_id: self.id,
                    record,
                })
            }
            Err(cause) => Err(self.rollback(cause).await),
        }
    }

    fn take_snapshot(&self) -> Result<(), FsError> {
        let live = &self.ctx.install.install_dir;
        info!(txn = %self.id, "Backing up {} to {}", live.display(), self.snapshot.display());
        std::fs::create_dir_all(&self.ctx.install.backup_dir)
            .map_err(|e| FsError::new(FsOp::CopyTree, &self.ctx.install.backup_dir, e))?;
        self.ctx.fs.copy_tree(live, &self.snapshot)
    }

    async fn swap_in(&mut self, staged: &StagedRelease) -> Result<VersionRecord, UpdateError> {
        let live = self.ctx.install.install_dir.clone();
        let aside = self.ctx.install.aside_dir();

        self.enter(InstallationState::Swapping);
        self.ctx
            .store
            .stash(&self.ctx.install.record_stash())
            .map_err(UpdateError::RecordFailed)?;

        // Rollback restarts the service even if stop only half worked
        self.progress.service_stopped = true;
        self.ctx.service.stop().await?;

        if self.ctx.install.verify_rollback_digest {
            let digest = tree_digest(&live).map_err(UpdateError::SnapshotFailed)?;
            debug!("Pre-update digest {}", digest);
            self.baseline_digest = Some(digest);
        }

        self.ctx
            .fs
            .rename(&live, &aside)
            .map_err(UpdateError::SwapFailed)?;
        self.progress.live_moved_aside = true;
        self.ctx
            .fs
            .rename(staged.root(), &live)
            .map_err(UpdateError::SwapFailed)?;
        info!(txn = %self.id, "New tree in place at {}", live.display());

        self.enter(InstallationState::RestoringData);
        self.restore_preserved(&aside, &live)?;
        self.apply_permissions(&live)?;

        self.enter(InstallationState::Verifying);
        self.progress.service_started = true;
        self.ctx.service.start().await?;
        self.ctx.await_active().await?;

        let release = staged.release();
        self.ctx
            .store
            .record(&release.version, &release.source_identifier)
            .map_err(UpdateError::RecordFailed)
    }

    fn restore_preserved(&self, aside: &Path, live: &Path) -> Result<(), UpdateError> {
        for rel in &self.ctx.install.preserved_paths {
            let old = aside.join(rel);
            match std::fs::symlink_metadata(&old) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Nothing to preserve at {}", rel.display());
                    continue;
                }
                Err(e) => {
                    return Err(UpdateError::DataRestoreFailed(FsError::new(
                        FsOp::CopyTree,
                        old,
                        e,
                    )))
                }
            }

            // Copy, not move: the aside tree must stay whole for rollback
            let new = live.join(rel);
            self.ctx
                .fs
                .remove_tree(&new)
                .map_err(UpdateError::DataRestoreFailed)?;
            self.ctx
                .fs
                .copy_tree(&old, &new)
                .map_err(UpdateError::DataRestoreFailed)?;
            info!("Preserved {}", rel.display());
        }
        Ok(())
    }

    fn apply_permissions(&self, live: &Path) -> Result<(), UpdateError> {
        let user = self
            .ctx
            .install
            .service_user
            .as_deref()
            .filter(|u| !u.trim().is_empty());
        if let Some(user) = user {
            if nix::unistd::geteuid().is_root() {
                self.ctx
                    .fs
                    .set_owner(live, user)
                    .map_err(UpdateError::PermissionsFailed)?;
            } else {
                debug!("Not root; leaving ownership of {} as is", live.display());
            }
        }

        for rel in &self.ctx.install.executable_files {
            let path = live.join(rel);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(UpdateError::PermissionsFailed(FsError::new(
                        FsOp::SetMode,
                        path,
                        e,
                    )))
                }
            }
            self.ctx
                .fs
                .set_mode(&path, 0o755)
                .map_err(UpdateError::PermissionsFailed)?;
        }
        Ok(())
    }

    fn commit(&self) {
        self.enter(InstallationState::Committed);
        info!(txn = %self.id, "Update committed");

        let fs = self.ctx.fs.as_ref();
        let aside = self.ctx.install.aside_dir();
        let discard = self.ctx.install.discard_dir();
        if let Err(e) = fs.remove_tree(&discard) {
            warn!("Could not remove stale {}: {}", discard.display(), e);
        }

        // The stash must outlive the aside tree: recovery restores them together
        let parked = match fs.rename(&aside, &discard) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not move previous tree out of the way: {}", e);
                match fs.remove_tree(&aside) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Could not remove previous tree: {}", e);
                        false
                    }
                }
            }
        };
        if parked {
            self.drop_record_stash();
        }
        if let Err(e) = fs.remove_tree(&discard) {
            warn!("Could not remove previous tree: {}", e);
        }
        if let Err(e) = fs.remove_tree(&self.snapshot) {
            warn!("Could not remove backup snapshot: {}", e);
        }
    }

    async fn rollback(&self, cause: UpdateError) -> UpdateError {
        warn!(txn = %self.id, "Update failed ({}); rolling back", cause);
        let mut problems = Vec::new();

        // systemctl start is a no-op on an active unit, so a new build that
        // came up must go down before its tree is swapped out
        let halted = if self.progress.service_started {
            match self.ctx.service.stop().await {
                Ok(()) => true,
                Err(e) => {
                    problems.push(format!("stopping new build: {}", e));
                    false
                }
            }
        } else {
            true
        };

        let tree_ok = !self.progress.live_moved_aside || self.restore_tree(&mut problems);

        let service_ok = if self.progress.service_stopped {
            match self.ctx.service.start().await {
                Ok(()) => match self.ctx.await_active().await {
                    Ok(()) => true,
                    Err(e) => {
                        problems.push(e.to_string());
                        false
                    }
                },
                Err(e) => {
                    problems.push(e.to_string());
                    false
                }
            }
        } else {
            true
        };

        if halted && tree_ok && service_ok {
            if let Err(e) = self.ctx.fs.remove_tree(&self.snapshot) {
                warn!("Could not remove backup snapshot: {}", e);
            }
            self.drop_record_stash();
            self.enter(InstallationState::RolledBack);
            info!(txn = %self.id, "Rolled back; previous version restored");
            return cause;
        }

        let detail = problems.join("; ");
        error!(
            txn = %self.id,
            "ROLLBACK FAILED: {}. Backup kept at {}",
            detail,
            self.snapshot.display()
        );
        self.enter(InstallationState::Failed);
        UpdateError::RollbackFailed {
            cause: Box::new(cause),
            detail,
            backup: Some(self.snapshot.clone()),
        }
    }

    fn drop_record_stash(&self) {
        let stash = self.ctx.install.record_stash();
        if let Err(e) = std::fs::remove_file(&stash) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", stash.display(), e);
            }
        }
    }

    /// Put the pre-update tree back at the live path.
    fn restore_tree(&self, problems: &mut Vec<String>) -> bool {
        let live = &self.ctx.install.install_dir;
        let aside = self.ctx.install.aside_dir();
        let fs = self.ctx.fs.as_ref();
        let earlier = problems.len();

        match fs.remove_tree(live).and_then(|_| fs.rename(&aside, live)) {
            Ok(()) => return self.verify_restored(live, problems),
            Err(e) => {
                warn!("Could not move {} back: {}", aside.display(), e);
                problems.push(format!("restoring aside tree: {}", e));
            }
        }

        warn!("Restoring {} from {}", live.display(), self.snapshot.display());
        match fs
            .remove_tree(live)
            .and_then(|_| fs.copy_tree(&self.snapshot, live))
        {
            Ok(()) => {
                problems.truncate(earlier);
                if let Err(e) = fs.remove_tree(&aside) {
                    warn!("Could not remove {}: {}", aside.display(), e);
                }
                true
            }
            Err(e) => {
                problems.push(format!("restoring from backup: {}", e));
                false
            }
        }
    }

    fn verify_restored(&self, live: &Path, problems: &mut Vec<String>) -> bool {
        let Some(expected) = &self.baseline_digest else {
            return true;
        };
        match tree_digest(live) {
            Ok(actual) if &actual == expected => {
                debug!("Restored tree matches pre-update digest");
                true
            }
            Ok(actual) => {
                problems.push(format!(
                    "restored tree digest {} does not match {}",
                    actual, expected
                ));
                false
            }
            Err(e) => {
                problems.push(format!("digest of restored tree: {}", e));
                false
            }
        }
    }
}

/// What [`recover_interrupted`] found and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// The aside tree of an interrupted swap was moved back to the live path
    pub restored_tree: bool,
    /// The version record was rewritten to describe the restored tree
    pub restored_record: bool,
    pub service_active: Option<bool>,
    /// Stale entries removed from scratch and the discard path
    pub removed: Vec<PathBuf>,
    /// Snapshots kept by failed rollbacks, left for the operator
    pub leftover_backups: Vec<PathBuf>,
}

/// Undo whatever an update killed mid-flight left behind.
///
/// Must only run while no transaction is in flight.
pub async fn recover_interrupted(ctx: &InstallContext) -> Result<RecoveryReport, UpdateError> {
    let mut report = RecoveryReport::default();
    let live = &ctx.install.install_dir;
    let aside = ctx.install.aside_dir();
    let discard = ctx.install.discard_dir();
    let stash = ctx.install.record_stash();

    if exists(&aside) {
        warn!(
            "Found {} from an interrupted update; restoring it",
            aside.display()
        );
        // The unverified new build may be running from the live tree
        if let Err(e) = ctx.service.stop().await {
            warn!("Could not stop {} before recovery: {}", ctx.service.name(), e);
        }
        ctx.fs
            .remove_tree(live)
            .and_then(|_| ctx.fs.rename(&aside, live))
            .map_err(|e| UpdateError::RollbackFailed {
                cause: Box::new(UpdateError::SwapFailed(e)),
                detail: format!(
                    "could not move {} back to {}",
                    aside.display(),
                    live.display()
                ),
                backup: None,
            })?;
        report.restored_tree = true;
        report.restored_record = restore_record(ctx, &stash)?;

        let active = match ctx.service.start().await {
            Ok(()) => ctx.await_active().await.is_ok(),
            Err(e) => {
                warn!("Could not start {} after recovery: {}", ctx.service.name(), e);
                false
            }
        };
        if !active {
            warn!("{} is not active after recovery", ctx.service.name());
        }
        report.service_active = Some(active);
    }

    if exists(&stash) {
        match std::fs::remove_file(&stash) {
            Ok(()) => report.removed.push(stash),
            Err(e) => warn!("Could not remove {}: {}", stash.display(), e),
        }
    }

    if exists(&discard) {
        match ctx.fs.remove_tree(&discard) {
            Ok(()) => report.removed.push(discard),
            Err(e) => warn!("Could not remove {}: {}", discard.display(), e),
        }
    }

    for entry in list_dir(&ctx.install.scratch_dir) {
        match ctx.fs.remove_tree(&entry) {
            Ok(()) => {
                debug!("Removed stale {}", entry.display());
                report.removed.push(entry);
            }
            Err(e) => warn!("Could not remove {}: {}", entry.display(), e),
        }
    }

    report.leftover_backups = list_dir(&ctx.install.backup_dir);
    if !report.leftover_backups.is_empty() {
        warn!(
            "{} backup snapshot(s) from failed rollbacks in {}",
            report.leftover_backups.len(),
            ctx.install.backup_dir.display()
        );
    }

    Ok(report)
}

/// Put back the version record stashed with the aside tree. Without a
/// stash the record was never touched by the interrupted update.
fn restore_record(ctx: &InstallContext, stash: &Path) -> Result<bool, UpdateError> {
    if !exists(stash) {
        return Ok(false);
    }
    match ctx.store.restore_stash(stash) {
        Ok(record) => {
            match &record {
                Some(r) => info!("Version record restored to {}", r.version),
                None => info!("Version record removed; restored tree had none"),
            }
            Ok(true)
        }
        Err(e @ VersionStoreError::Corrupt { .. }) => {
            warn!("Ignoring unreadable record stash: {}", e);
            Ok(false)
        }
        Err(e) => Err(UpdateError::RollbackFailed {
            detail: format!("could not restore version record: {}", e),
            cause: Box::new(UpdateError::RecordFailed(e)),
            backup: None,
        }),
    }
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            paths.sort();
            paths
        }
        Err(_) => Vec::new(),
    }
}
