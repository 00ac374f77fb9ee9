//! Utility functions

use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, IoContext, Result};

/// Ensure a directory exists and carries exactly `mode`
pub fn ensure_dir<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
    let path = path.as_ref();

    if path.exists() {
        if !path.is_dir() {
            return Err(Error::precondition(format!(
                "{} exists but is not a directory",
                path.display()
            )));
        }
    } else {
        fs::create_dir_all(path).io_context(|| format!("creating {}", path.display()))?;
    }

    // create_dir is subject to the umask, so the mode is always applied explicitly
    fs::set_permissions(path, Permissions::from_mode(mode))
        .io_context(|| format!("chmod {:o} {}", mode, path.display()))?;

    Ok(())
}

/// Create parent directories with given permissions
pub fn create_parent_dirs<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
    if let Some(parent) = path.as_ref().parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        fs::set_permissions(parent, Permissions::from_mode(mode))
            .io_context(|| format!("chmod {:o} {}", mode, parent.display()))?;
    }
    Ok(())
}

/// Replace `path` with `contents` through a sibling temp file and rename(2).
///
/// Readers see either the old or the new file, never a truncated one.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8], mode: u32) -> Result<()> {
    let staged = stage_file(path.as_ref(), contents, mode)?;
    commit_staged(staged)
}

/// A fully written temp file waiting to be renamed over its target.
pub struct StagedFile {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// First half of [`write_atomic`]: write and fsync the temp file.
pub fn stage_file(path: &Path, contents: &[u8], mode: u32) -> Result<StagedFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("/"));
    let mut file = NamedTempFile::new_in(dir)
        .io_context(|| format!("creating temp file in {}", dir.display()))?;

    file.write_all(contents)
        .io_context(|| format!("writing {}", file.path().display()))?;
    file.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .io_context(|| format!("chmod {:o} {}", mode, file.path().display()))?;
    file.as_file()
        .sync_all()
        .io_context(|| format!("syncing {}", file.path().display()))?;

    Ok(StagedFile {
        file,
        target: path.to_path_buf(),
    })
}

/// Second half of [`write_atomic`]: rename the temp file over its target.
pub fn commit_staged(staged: StagedFile) -> Result<()> {
    let target = staged.target;
    staged
        .file
        .persist(&target)
        .map_err(|e| e.error)
        .io_context(|| format!("renaming into {}", target.display()))?;
    Ok(())
}

/// Copy `source` to `dest` through a temp file so that a destination which is
/// currently being executed is replaced instead of rewritten in place.
///
/// Returns `false` when `dest` already has the same size and permission bits.
pub fn copy_atomic(source: &Path, dest: &Path) -> Result<bool> {
    let src_meta =
        fs::metadata(source).io_context(|| format!("reading metadata of {}", source.display()))?;

    if let Ok(dest_meta) = fs::symlink_metadata(dest)
        && dest_meta.is_file()
        && dest_meta.len() == src_meta.len()
        && dest_meta.permissions().mode() == src_meta.permissions().mode()
    {
        return Ok(false);
    }

    create_parent_dirs(dest, 0o755)?;
    let dir = dest.parent().unwrap_or_else(|| Path::new("/"));
    let tmp = NamedTempFile::new_in(dir)
        .io_context(|| format!("creating temp file in {}", dir.display()))?;

    fs::copy(source, tmp.path())
        .io_context(|| format!("copying {} to {}", source.display(), dest.display()))?;
    fs::set_permissions(tmp.path(), src_meta.permissions())
        .io_context(|| format!("chmod {}", tmp.path().display()))?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .io_context(|| format!("renaming into {}", dest.display()))?;

    Ok(true)
}

/// Map an absolute host path to the same path below `root`.
pub fn mirror_path(root: &Path, absolute: &Path) -> PathBuf {
    let relative = absolute.strip_prefix("/").unwrap_or(absolute);
    root.join(relative)
}
