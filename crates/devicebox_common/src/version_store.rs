//! Persisted record of the installed build.
//!
//! The record lives outside the install tree so a tree swap never touches
//! it. Writes go to a temp file in the same directory which is then renamed
//! over the record: a crash leaves either the old or the new record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::version::BuildVersion;

/// On-disk version record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: BuildVersion,
    pub updated_at: DateTime<Utc>,
    /// Tag or commit the release source reported for this build
    #[serde(default)]
    pub source_identifier: String,
}

#[derive(Error, Debug)]
pub enum VersionStoreError {
    #[error("version record {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("version record {} I/O error: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. `Ok(None)` means nothing was ever recorded.
    pub fn current(&self) -> Result<Option<VersionRecord>, VersionStoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VersionStoreError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        serde_json::from_str::<VersionRecord>(&content)
            .map(Some)
            .map_err(|e| VersionStoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Installed version, treating a corrupt or unreadable record as the
    /// minimum so any valid release compares as newer.
    pub fn current_version(&self) -> Option<BuildVersion> {
        match self.current() {
            Ok(record) => record.map(|r| r.version),
            Err(e) => {
                warn!("Treating installed version as unknown: {}", e);
                None
            }
        }
    }

    /// Atomically replace the record.
    pub fn record(
        &self,
        version: &BuildVersion,
        source_identifier: &str,
    ) -> Result<VersionRecord, VersionStoreError> {
        let record = VersionRecord {
            version: version.clone(),
            updated_at: Utc::now(),
            source_identifier: source_identifier.to_string(),
        };
        write_json(&self.path, &record)?;
        debug!("Recorded installed version {} in {}", version, self.path.display());
        Ok(record)
    }

    /// Save the current record (or its absence) to `stash`, so it can be
    /// put back by [`VersionStore::restore_stash`] if the tree it describes
    /// is restored. A corrupt record is stashed as absent.
    pub fn stash(&self, stash: &Path) -> Result<(), VersionStoreError> {
        let current = match self.current() {
            Ok(record) => record,
            Err(VersionStoreError::Corrupt { .. }) => None,
            Err(e) => return Err(e),
        };
        write_json(stash, &current)
    }

    /// Put a stashed record back and delete the stash. Returns the restored
    /// record; `None` means the stash recorded no version and the record
    /// file was removed.
    pub fn restore_stash(&self, stash: &Path) -> Result<Option<VersionRecord>, VersionStoreError> {
        let content = fs::read_to_string(stash).map_err(|source| VersionStoreError::Io {
            path: stash.to_path_buf(),
            source,
        })?;
        let stashed: Option<VersionRecord> =
            serde_json::from_str(&content).map_err(|e| VersionStoreError::Corrupt {
                path: stash.to_path_buf(),
                reason: e.to_string(),
            })?;

        match &stashed {
            Some(record) => write_json(&self.path, record)?,
            None => match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(VersionStoreError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            },
        }

        fs::remove_file(stash).map_err(|source| VersionStoreError::Io {
            path: stash.to_path_buf(),
            source,
        })?;
        debug!("Restored version record from {}", stash.display());
        Ok(stashed)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), VersionStoreError> {
    let content = serde_json::to_string_pretty(value).map_err(|e| VersionStoreError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;
    write_atomic(path, content.as_bytes()).map_err(|source| VersionStoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Temp file in the same directory, fsync, rename over `path`, fsync the directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "version.json".to_string());
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        // Persist the directory entry change
        fs::File::open(&parent)?.sync_all()
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
