//! Filesystem operations used by the installation transaction.
//!
//! Each call reports which operation failed on which path, so rollback can
//! tell exactly how far a swap got without parsing subprocess output.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Rename,
    CopyTree,
    RemoveTree,
    SetOwner,
    SetMode,
    Digest,
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsOp::Rename => "rename",
            FsOp::CopyTree => "copy",
            FsOp::RemoveTree => "remove",
            FsOp::SetOwner => "chown",
            FsOp::SetMode => "chmod",
            FsOp::Digest => "digest",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("{op} {}: {source}", path.display())]
pub struct FsError {
    pub op: FsOp,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl FsError {
    pub fn new(op: FsOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Mutating filesystem primitives the transaction is built from.
pub trait FileSystem: Send + Sync {
    /// Atomic directory-entry rename. Both paths must be on one filesystem.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Copy a file or a whole directory tree to `to`, which must not exist.
    fn copy_tree(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Remove a file or directory tree. A missing path is not an error.
    fn remove_tree(&self, path: &Path) -> Result<(), FsError>;

    /// Recursively hand `path` to `user` (and the user's primary group).
    fn set_owner(&self, path: &Path, user: &str) -> Result<(), FsError>;

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        fs::rename(from, to).map_err(|e| FsError::new(FsOp::Rename, from, e))
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let meta = fs::symlink_metadata(from).map_err(|e| FsError::new(FsOp::CopyTree, from, e))?;
        if !meta.is_dir() {
            return copy_entry(from, to, &meta);
        }

        for entry in WalkDir::new(from).follow_links(false) {
            let entry = entry.map_err(|e| walk_error(FsOp::CopyTree, from, e))?;
            let rel = entry
                .path()
                .strip_prefix(from)
                .map_err(|e| FsError::new(FsOp::CopyTree, entry.path(), io::Error::other(e)))?;
            let dest = to.join(rel);
            let meta = entry
                .path()
                .symlink_metadata()
                .map_err(|e| FsError::new(FsOp::CopyTree, entry.path(), e))?;
            copy_entry(entry.path(), &dest, &meta)?;
        }
        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<(), FsError> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(path).map_err(|e| FsError::new(FsOp::RemoveTree, path, e))
            }
            Ok(_) => fs::remove_file(path).map_err(|e| FsError::new(FsOp::RemoveTree, path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::new(FsOp::RemoveTree, path, e)),
        }
    }

    fn set_owner(&self, path: &Path, user: &str) -> Result<(), FsError> {
        let account = nix::unistd::User::from_name(user)
            .map_err(|e| FsError::new(FsOp::SetOwner, path, io::Error::from(e)))?
            .ok_or_else(|| {
                FsError::new(
                    FsOp::SetOwner,
                    path,
                    io::Error::new(io::ErrorKind::NotFound, format!("no such user: {}", user)),
                )
            })?;
        let uid = account.uid.as_raw();
        let gid = account.gid.as_raw();

        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry.map_err(|e| walk_error(FsOp::SetOwner, path, e))?;
            std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))
                .map_err(|e| FsError::new(FsOp::SetOwner, entry.path(), e))?;
        }
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| FsError::new(FsOp::SetMode, path, e))
    }
}

fn copy_entry(src: &Path, dest: &Path, meta: &fs::Metadata) -> Result<(), FsError> {
    let file_type = meta.file_type();
    if file_type.is_dir() {
        fs::create_dir_all(dest).map_err(|e| FsError::new(FsOp::CopyTree, dest, e))?;
        fs::set_permissions(dest, meta.permissions())
            .map_err(|e| FsError::new(FsOp::CopyTree, dest, e))?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(src).map_err(|e| FsError::new(FsOp::CopyTree, src, e))?;
        std::os::unix::fs::symlink(&target, dest)
            .map_err(|e| FsError::new(FsOp::CopyTree, dest, e))?;
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::new(FsOp::CopyTree, parent, e))?;
        }
        // fs::copy carries the permission bits over
        fs::copy(src, dest).map_err(|e| FsError::new(FsOp::CopyTree, src, e))?;
    }
    Ok(())
}

fn walk_error(op: FsOp, root: &Path, e: walkdir::Error) -> FsError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    FsError::new(op, path, source)
}

/// SHA-256 over the names, kinds and contents of every entry under `root`.
///
/// Entries are visited in name order, so two trees with identical content
/// produce the same digest regardless of creation order.
pub fn tree_digest(root: &Path) -> Result<String, FsError> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(FsOp::Digest, root, e))?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            hasher.update(format!("D {}\n", rel).as_bytes());
        } else if file_type.is_symlink() {
            let target =
                fs::read_link(entry.path()).map_err(|e| FsError::new(FsOp::Digest, entry.path(), e))?;
            hasher.update(format!("L {} {}\n", rel, target.display()).as_bytes());
        } else {
            hasher.update(format!("F {}\n", rel).as_bytes());
            let mut file =
                fs::File::open(entry.path()).map_err(|e| FsError::new(FsOp::Digest, entry.path(), e))?;
            loop {
                let n = file
                    .read(&mut buffer)
                    .map_err(|e| FsError::new(FsOp::Digest, entry.path(), e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("data/printers")).unwrap();
        fs::write(root.join("app.py"), "print('hello')\n").unwrap();
        fs::write(root.join("data/printers/zebra.json"), "{\"dpi\": 203}").unwrap();
        std::os::unix::fs::symlink("app.py", root.join("main.py")).unwrap();
    }

    #[test]
    fn test_copy_tree_reproduces_digest() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        sample_tree(&src);

        LocalFs.copy_tree(&src, &dest).unwrap();

        assert_eq!(tree_digest(&src).unwrap(), tree_digest(&dest).unwrap());
        assert!(fs::symlink_metadata(dest.join("main.py"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_copy_tree_single_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("config.json");
        fs::write(&src, "{}").unwrap();

        let dest = temp.path().join("nested/config.json");
        LocalFs.copy_tree(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest).unwrap(), "{}");
    }

    #[test]
    fn test_digest_changes_with_content() {
        let temp = TempDir::new().unwrap();
        sample_tree(temp.path());
        let before = tree_digest(temp.path()).unwrap();

        fs::write(temp.path().join("app.py"), "print('changed')\n").unwrap();
        assert_ne!(before, tree_digest(temp.path()).unwrap());
    }

    #[test]
    fn test_remove_tree_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        LocalFs.remove_tree(&temp.path().join("nope")).unwrap();

        sample_tree(&temp.path().join("tree"));
        LocalFs.remove_tree(&temp.path().join("tree")).unwrap();
        assert!(!temp.path().join("tree").exists());
    }

    #[test]
    fn test_rename_error_names_operation() {
        let temp = TempDir::new().unwrap();
        let err = LocalFs
            .rename(&temp.path().join("missing"), &temp.path().join("other"))
            .unwrap_err();
        assert_eq!(err.op, FsOp::Rename);
        assert!(err.to_string().starts_with("rename "));
    }

    #[test]
    fn test_set_mode() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("app.py");
        fs::write(&file, "").unwrap();

        LocalFs.set_mode(&file, 0o755).unwrap();
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_set_owner_unknown_user() {
        let temp = TempDir::new().unwrap();
        let err = LocalFs
            .set_owner(temp.path(), "no-such-devicebox-user")
            .unwrap_err();
        assert_eq!(err.op, FsOp::SetOwner);
    }
}
