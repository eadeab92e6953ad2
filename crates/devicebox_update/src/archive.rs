//! Release archive extraction (zip and tar.gz).
//!
//! The format is detected from magic bytes, not the URL. Entries that would
//! land outside the destination are rejected, and a release must unpack to
//! exactly one top-level directory which becomes the staged tree.

use devicebox_common::UpdateError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub fn detect_format(path: &Path) -> Result<ArchiveFormat, UpdateError> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(|e| extract_err(path, e))?;
    let n = read_up_to(&mut file, &mut magic).map_err(|e| extract_err(path, e))?;

    match &magic[..n] {
        [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => Ok(ArchiveFormat::Zip),
        [0x1f, 0x8b, ..] => Ok(ArchiveFormat::TarGz),
        _ => Err(UpdateError::ExtractFailed(format!(
            "{} is neither zip nor gzip",
            path.display()
        ))),
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Unpack `archive` into `dest` and return the single top-level directory.
pub fn extract(archive: &Path, dest: &Path) -> Result<PathBuf, UpdateError> {
    let format = detect_format(archive)?;
    fs::create_dir_all(dest).map_err(|e| extract_err(dest, e))?;
    debug!("Extracting {:?} archive {}", format, archive.display());

    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest)?,
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest)?,
    }
    single_top_level(dest)
}

/// The only entry under `dest`, which must be a directory.
pub fn single_top_level(dest: &Path) -> Result<PathBuf, UpdateError> {
    let entries = fs::read_dir(dest)
        .map_err(|e| extract_err(dest, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| extract_err(dest, e))?;

    match entries.as_slice() {
        [only] => {
            let is_dir = only
                .file_type()
                .map(|t| t.is_dir())
                .map_err(|e| extract_err(&only.path(), e))?;
            if is_dir {
                Ok(only.path())
            } else {
                Err(UpdateError::ExtractFailed(format!(
                    "top-level entry {} is not a directory",
                    only.file_name().to_string_lossy()
                )))
            }
        }
        [] => Err(UpdateError::ExtractFailed("archive is empty".into())),
        many => Err(UpdateError::ExtractFailed(format!(
            "expected one top-level directory, found {}",
            many.len()
        ))),
    }
}

fn extract_err(path: &Path, e: impl std::fmt::Display) -> UpdateError {
    UpdateError::ExtractFailed(format!("{}: {}", path.display(), e))
}

/// `name` as a relative path with only normal components.
fn enclosed(name: &Path) -> Result<PathBuf, UpdateError> {
    let mut clean = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(UpdateError::ExtractFailed(format!(
                    "entry escapes destination: {}",
                    name.display()
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(UpdateError::ExtractFailed("entry with empty name".into()));
    }
    Ok(clean)
}

/// Whether a symlink at `link` (relative to the destination) pointing at
/// `target` resolves inside the destination.
fn link_stays_inside(link: &Path, target: &Path) -> bool {
    let mut depth: usize = link.parent().map_or(0, |p| p.components().count());
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = File::open(archive).map_err(|e| extract_err(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extract_err(archive, e))?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| extract_err(archive, e))?;
        let rel = enclosed(Path::new(entry.name()))?;
        let out = dest.join(&rel);
        let mode = entry.unix_mode();

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(|e| extract_err(&out, e))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(|e| extract_err(parent, e))?;
        }

        if mode.map_or(false, |m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            entry
                .read_to_string(&mut target)
                .map_err(|e| extract_err(&out, e))?;
            if !link_stays_inside(&rel, Path::new(&target)) {
                return Err(UpdateError::ExtractFailed(format!(
                    "symlink {} points outside the release",
                    rel.display()
                )));
            }
            std::os::unix::fs::symlink(&target, &out).map_err(|e| extract_err(&out, e))?;
            continue;
        }

        let mut writer = File::create(&out).map_err(|e| extract_err(&out, e))?;
        io::copy(&mut entry, &mut writer).map_err(|e| extract_err(&out, e))?;
        if let Some(mode) = mode {
            fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| extract_err(&out, e))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = File::open(archive).map_err(|e| extract_err(archive, e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);

    for entry in tar.entries().map_err(|e| extract_err(archive, e))? {
        let mut entry = entry.map_err(|e| extract_err(archive, e))?;
        let entry_type = entry.header().entry_type();
        let raw = entry.path().map_err(|e| extract_err(archive, e))?.into_owned();

        // pax headers (GitHub tarballs carry a global one) and device nodes
        if !(entry_type.is_file()
            || entry_type.is_dir()
            || entry_type.is_symlink()
            || entry_type.is_hard_link())
        {
            debug!("Skipping {:?} entry {}", entry_type, raw.display());
            continue;
        }

        let rel = enclosed(&raw)?;
        if entry_type.is_symlink() {
            let target = entry
                .link_name()
                .map_err(|e| extract_err(&raw, e))?
                .map(|t| t.into_owned())
                .unwrap_or_default();
            if !link_stays_inside(&rel, &target) {
                return Err(UpdateError::ExtractFailed(format!(
                    "symlink {} points outside the release",
                    rel.display()
                )));
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| extract_err(&raw, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::FileOptions::default();
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_zip_single_top_level() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release");
        write_zip(
            &archive,
            &[
                ("DeviceBox-1.1.0/", ""),
                ("DeviceBox-1.1.0/app.py", "print('1.1.0')\n"),
                ("DeviceBox-1.1.0/static/app.js", "//"),
            ],
        );

        assert_eq!(detect_format(&archive).unwrap(), ArchiveFormat::Zip);
        let root = extract(&archive, &temp.path().join("out")).unwrap();
        assert_eq!(root.file_name().unwrap(), "DeviceBox-1.1.0");
        assert_eq!(
            fs::read_to_string(root.join("app.py")).unwrap(),
            "print('1.1.0')\n"
        );
        assert!(root.join("static/app.js").is_file());
    }

    #[test]
    fn test_tar_gz_skips_pax_global_header() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release");

        let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let pax = b"52 comment=3f2a9c1e0b7d4a55c0ffee1234567890abcdef12\n";
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::XGlobalHeader);
        header.set_size(pax.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "pax_global_header", &pax[..])
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "DeviceBox-main/app.py", &b"x=1"[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert_eq!(detect_format(&archive).unwrap(), ArchiveFormat::TarGz);
        let root = extract(&archive, &temp.path().join("out")).unwrap();
        assert_eq!(root.file_name().unwrap(), "DeviceBox-main");
        let mode = fs::metadata(root.join("app.py")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_two_top_level_directories() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release.tar.gz");
        write_tar_gz(&archive, &[("a/app.py", "1"), ("b/app.py", "2")]);

        let err = extract(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, UpdateError::ExtractFailed(_)));
    }

    #[test]
    fn test_loose_files_at_top_level() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release.zip");
        write_zip(&archive, &[("app.py", "1")]);

        let err = extract(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, UpdateError::ExtractFailed(_)));
    }

    #[test]
    fn test_zip_path_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release.zip");
        write_zip(
            &archive,
            &[("pkg/app.py", "1"), ("pkg/../../evil.txt", "owned")],
        );

        let out = temp.path().join("nested/out");
        let err = extract(&archive, &out).unwrap_err();
        assert!(matches!(err, UpdateError::ExtractFailed(_)));
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn test_tar_path_traversal_rejected() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release.tar.gz");

        let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_old();
        let name = b"../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(5);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"owned"[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = extract(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, UpdateError::ExtractFailed(_)));
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn test_unknown_format() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("release.zip");
        fs::write(&archive, "<html>Not Found</html>").unwrap();
        assert!(matches!(
            detect_format(&archive),
            Err(UpdateError::ExtractFailed(_))
        ));
    }

    #[test]
    fn test_link_containment() {
        assert!(link_stays_inside(Path::new("pkg/current"), Path::new("releases/1.1.0")));
        assert!(link_stays_inside(Path::new("pkg/bin/run"), Path::new("../app.py")));
        assert!(!link_stays_inside(Path::new("pkg/x"), Path::new("../../etc/passwd")));
        assert!(!link_stays_inside(Path::new("pkg/x"), Path::new("/etc/passwd")));
    }
}
