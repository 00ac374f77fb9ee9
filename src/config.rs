//! Runtime settings derived from the command line

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::statvfs::statvfs;

use crate::builder::{DEFAULT_BINARIES, same_binary};
use crate::cli::{Args, Command};
use crate::deps::ClosureMode;
use crate::environment::ChrootEnvironment;
use crate::error::{Error, IoContext, Result};
use crate::mount::real_path;

pub const DEFAULT_MIN_FREE_MB: u64 = 1024;
pub const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

/// Everything the commands need, resolved once from [`Args`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Absolute sandbox root, symlinks resolved
    pub root: PathBuf,
    /// Default binary set plus any `--binary` extras, in request order
    pub binaries: Vec<String>,
    pub closure_mode: ClosureMode,
    pub tmp_size: String,
    pub session_timeout: Option<Duration>,
    pub min_free_bytes: u64,
    pub unit_dir: PathBuf,
}

impl Settings {
    /// Create settings from CLI arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let root = std::path::absolute(&args.root)
            .io_context(|| format!("resolving {}", args.root.display()))?;
        // Mount points are reported by real path
        let root = real_path(&root);
        if root.parent().is_none() {
            return Err(Error::precondition(format!(
                "{} resolves to the host root",
                args.root.display()
            )));
        }

        let mut binaries: Vec<String> = DEFAULT_BINARIES.iter().map(|b| b.to_string()).collect();
        let mut closure_mode = ClosureMode::default();
        let mut session_timeout = None;

        match &args.command {
            Command::Install {
                binaries: extra,
                single_level,
                ..
            } => {
                for binary in extra {
                    if !binaries.iter().any(|b| same_binary(b, binary)) {
                        binaries.push(binary.clone());
                    }
                }
                if *single_level {
                    closure_mode = ClosureMode::SingleLevel;
                }
            }
            Command::Enter {
                session_timeout: Some(secs),
                ..
            } => session_timeout = Some(Duration::from_secs(*secs)),
            _ => {}
        }

        Ok(Self {
            root,
            binaries,
            closure_mode,
            tmp_size: args.tmp_size.clone(),
            session_timeout,
            min_free_bytes: args.min_free_mb.saturating_mul(1024 * 1024),
            unit_dir: args.unit_dir.clone(),
        })
    }

    pub fn environment(&self) -> ChrootEnvironment {
        ChrootEnvironment::new(&self.root)
    }
}

/// Fail unless the filesystem that will hold `path` has `required` bytes free.
///
/// `path` need not exist yet; its nearest existing ancestor is measured.
pub fn check_free_space(path: &Path, required: u64) -> Result<()> {
    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let stat = statvfs(probe).io_context(|| format!("statvfs {}", probe.display()))?;
    let available = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);

    log::debug!(
        "{} bytes available on the filesystem of {}",
        available,
        probe.display()
    );
    if available < required {
        return Err(Error::precondition(format!(
            "insufficient disk space for {}: {} MiB available, {} MiB required",
            path.display(),
            available / (1024 * 1024),
            required / (1024 * 1024)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn settings(args: &[&str]) -> Settings {
        let args = Args::try_parse_from(std::iter::once("secure-chroot").chain(args.iter().copied()))
            .unwrap();
        Settings::from_args(&args).unwrap()
    }

    #[test]
    fn test_extra_binaries_are_appended_once() {
        // `bash` is in the default set as `/bin/bash`
        let s = settings(&[
            "install",
            "--binary",
            "htop",
            "--binary",
            "bash",
            "--binary",
            "htop",
            "--single-level",
        ]);
        assert_eq!(s.binaries.len(), DEFAULT_BINARIES.len() + 1);
        assert_eq!(s.binaries.last().map(String::as_str), Some("htop"));
        assert_eq!(s.closure_mode, ClosureMode::SingleLevel);
    }

    #[test]
    fn test_enter_timeout() {
        let s = settings(&["--root", "/srv/jail", "enter", "alice", "--session-timeout", "90"]);
        assert_eq!(s.session_timeout, Some(Duration::from_secs(90)));
        assert_eq!(s.closure_mode, ClosureMode::Transitive);
        assert_eq!(s.environment().root(), Path::new("/srv/jail"));
    }

    #[test]
    fn test_relative_root_is_made_absolute() {
        let s = settings(&["--root", "jail", "status"]);
        assert!(s.root.is_absolute());
        assert!(s.root.ends_with("jail"));
    }

    #[test]
    fn test_symlinked_root_is_resolved() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, tmp.path().join("link")).unwrap();

        let via_link = tmp.path().join("link/jail");
        let s = settings(&["--root", via_link.to_str().unwrap(), "status"]);
        assert_eq!(s.root, std::fs::canonicalize(&real).unwrap().join("jail"));

        std::os::unix::fs::symlink("/", tmp.path().join("host")).unwrap();
        let args = Args::try_parse_from([
            "secure-chroot",
            "--root",
            tmp.path().join("host").to_str().unwrap(),
            "status",
        ])
        .unwrap();
        assert!(matches!(Settings::from_args(&args), Err(Error::PreconditionFailed(_))));
    }

    #[test]
    fn test_free_space_uses_existing_ancestor() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("not/yet/created");

        check_free_space(&missing, 0)?;
        let err = check_free_space(&missing, u64::MAX).unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
        Ok(())
    }
}
