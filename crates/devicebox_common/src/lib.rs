//! DeviceBox Common - shared types for the self-update engine.
//!
//! Configuration, the error taxonomy, build version ordering, the persisted
//! version record and the filesystem primitives the installation
//! transaction is built from.

pub mod config;
pub mod error;
pub mod fsops;
pub mod logging;
pub mod version;
pub mod version_store;

pub use config::{SourceKind, SupervisorKind, UpdaterConfig};
pub use error::{ErrorKind, UpdateError};
pub use fsops::{tree_digest, FileSystem, FsError, FsOp, LocalFs};
pub use version::{is_update_available, BuildVersion};
pub use version_store::{VersionRecord, VersionStore, VersionStoreError};

/// Updater version, sent as part of the User-Agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
