//! DeviceBox Update - unattended self-update engine for DeviceBox appliances.
//!
//! Resolves the latest published build, downloads it into scratch space and
//! swaps it into the live install path as a single transaction: either the
//! new build is running and recorded, or the previous build is running
//! again.

pub mod archive;
pub mod fetcher;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod transaction;

pub use fetcher::{ArtifactFetcher, HttpFetcher, StagedRelease};
pub use orchestrator::{ApplyOutcome, CheckOutcome, UpdateOrchestrator};
pub use resolver::{ReleaseDescriptor, ReleaseResolver, ReleaseSource};
pub use retry::{poll_until, PollBudget, PollOutcome};
pub use service::{NoopController, ServiceController, SystemctlController};
pub use transaction::{
    recover_interrupted, InstallContext, InstallationState, RecoveryReport, StateHandle,
    Transaction,
};
