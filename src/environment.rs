//! The chroot environment value threaded through every component

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, IoContext, Result};
use crate::utils::mirror_path;

/// Default location of the sandbox root
pub const DEFAULT_ROOT: &str = "/opt/secure_chroot";

/// An alternate filesystem root on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootEnvironment {
    root: PathBuf,
}

impl ChrootEnvironment {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// An environment counts as initialized once its credential tables exist.
    pub fn is_initialized(&self) -> bool {
        self.inside("/etc/passwd").is_file()
    }

    /// Host path of an absolute path as seen from inside the sandbox.
    pub fn inside<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        mirror_path(&self.root, path.as_ref())
    }

    /// Host directory of an account's home.
    pub fn home_of(&self, username: &str) -> PathBuf {
        self.root.join("home").join(username)
    }

    /// Name of the host that owns this environment.
    pub fn host(&self) -> String {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Bytes used below the root, without crossing into other filesystems.
    pub fn size(&self) -> Result<u64> {
        let meta = fs::symlink_metadata(&self.root)
            .io_context(|| format!("reading {}", self.root.display()))?;
        Ok(tree_size(&self.root, meta.dev()))
    }

    /// Lock file path, kept next to the root so cleanup can remove the root.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .root
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "secure_chroot".into());
        name.push(".lock");
        self.root.with_file_name(name)
    }

    /// Serialize mutating commands against this root.
    pub fn lock(&self) -> Result<EnvironmentLock> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .io_context(|| format!("opening {}", path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                log::debug!("Acquired environment lock {}", path.display());
                Ok(EnvironmentLock { _flock: flock, path })
            }
            Err((_, Errno::EAGAIN)) => Err(Error::precondition(format!(
                "environment {} is busy (another invocation holds {})",
                self.root.display(),
                path.display()
            ))),
            Err((_, errno)) => Err(errno).io_context(|| format!("locking {}", path.display())),
        }
    }
}

/// Held for the duration of a mutating command; released on drop.
pub struct EnvironmentLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        log::debug!("Releasing environment lock {}", self.path.display());
    }
}

fn tree_size(path: &Path, dev: u64) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.dev() != dev {
        return 0;
    }
    let mut total = meta.len();
    if meta.is_dir()
        && let Ok(entries) = fs::read_dir(path)
    {
        for entry in entries.flatten() {
            total += tree_size(&entry.path(), dev);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_inside_maps_absolute_paths() {
        let env = ChrootEnvironment::new("/opt/secure_chroot");
        assert_eq!(
            env.inside("/etc/passwd"),
            PathBuf::from("/opt/secure_chroot/etc/passwd")
        );
        assert_eq!(
            env.home_of("alice"),
            PathBuf::from("/opt/secure_chroot/home/alice")
        );
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let env = ChrootEnvironment::new("/opt/secure_chroot");
        assert_eq!(env.lock_path(), PathBuf::from("/opt/secure_chroot.lock"));
    }

    #[test]
    fn test_missing_root() {
        let env = ChrootEnvironment::new("/nonexistent/secure_chroot");
        assert!(!env.exists());
        assert!(!env.is_initialized());
        assert!(env.size().is_err());
    }

    #[test]
    fn test_size_counts_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/passwd"), vec![b'x'; 4096]).unwrap();

        let env = ChrootEnvironment::new(&root);
        assert!(env.is_initialized());
        assert!(env.size().unwrap() >= 4096);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));

        let first = env.lock().unwrap();
        let second = env.lock();
        assert!(matches!(second, Err(Error::PreconditionFailed(_))));

        drop(first);
        assert!(env.lock().is_ok());
    }
}
