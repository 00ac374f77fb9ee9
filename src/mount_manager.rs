//! Transient mounts below the sandbox root
//!
//! Every step is best-effort: a failed mount is reported and the sequence
//! continues, and unmounting tolerates targets that were never mounted. That
//! makes [`MountManager::unmount_all`] safe to call at any point, any number
//! of times.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bind_mount::{DEV_BIND, bind_mount};
use crate::environment::ChrootEnvironment;
use crate::error::{Error, Result};
use crate::mount::{self, MountTable, UnmountOutcome};

pub const DEFAULT_TMP_SIZE: &str = "512M";
const DEVPTS_OPTIONS: &str = "gid=5,mode=620,ptmxmode=0666";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// proc at `/proc`
    ProcessInfo,
    /// sysfs at `/sys`
    SystemInfo,
    /// host `/dev` bound at `/dev`
    DeviceBind,
    /// devpts at `/dev/pts`
    Pty,
    /// size-capped tmpfs at `/tmp`
    TempScratch,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountKind::ProcessInfo => "proc",
            MountKind::SystemInfo => "sysfs",
            MountKind::DeviceBind => "dev",
            MountKind::Pty => "devpts",
            MountKind::TempScratch => "tmpfs",
        };
        f.pad(name)
    }
}

/// One mount the sandbox needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path of the mount point
    pub target: PathBuf,
    pub options: Option<String>,
}

/// Seam between the manager and the kernel.
pub trait Mounter {
    fn is_mounted(&self, target: &Path) -> Result<bool>;
    fn mount(&self, spec: &MountSpec) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<UnmountOutcome>;
    /// Every mount point at or below `root`.
    fn mounted_below(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

impl<T: Mounter + ?Sized> Mounter for &T {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        (**self).is_mounted(target)
    }
    fn mount(&self, spec: &MountSpec) -> Result<()> {
        (**self).mount(spec)
    }
    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        (**self).unmount(target)
    }
    fn mounted_below(&self, root: &Path) -> Result<Vec<PathBuf>> {
        (**self).mounted_below(root)
    }
}

/// Mounter backed by mount(2) and `/proc/self/mountinfo`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(MountTable::read()?.is_mount_point(target))
    }

    fn mount(&self, spec: &MountSpec) -> Result<()> {
        match spec.kind {
            MountKind::ProcessInfo => mount::mount_proc(&spec.target),
            MountKind::SystemInfo => mount::mount_sysfs(&spec.target),
            // Not recursive: host submounts of /dev stay out of the sandbox
            MountKind::DeviceBind => bind_mount("/dev", &spec.target, DEV_BIND),
            MountKind::Pty => {
                mount::mount_devpts(&spec.target, spec.options.as_deref().unwrap_or(DEVPTS_OPTIONS))
            }
            MountKind::TempScratch => {
                mount::mount_tmpfs(&spec.target, 0o1777, spec.options.as_deref())
            }
        }
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        mount::unmount(target)
    }

    fn mounted_below(&self, root: &Path) -> Result<Vec<PathBuf>> {
        Ok(MountTable::read()?.below(root))
    }
}

#[derive(Debug)]
pub enum MountOutcome {
    Mounted,
    AlreadyMounted,
    Failed(Error),
}

/// Per-kind result of [`MountManager::mount_all`]
#[derive(Debug, Default)]
pub struct MountReport {
    pub outcomes: Vec<(MountKind, MountOutcome)>,
}

impl MountReport {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, MountOutcome::Failed(_)))
            .count()
    }
}

impl fmt::Display for MountReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, outcome) in &self.outcomes {
            match outcome {
                MountOutcome::Mounted => writeln!(f, "  {:<7} mounted", kind)?,
                MountOutcome::AlreadyMounted => writeln!(f, "  {:<7} already mounted", kind)?,
                MountOutcome::Failed(err) => writeln!(f, "  {:<7} FAILED: {}", kind, err)?,
            }
        }
        Ok(())
    }
}

/// Per-target result of [`MountManager::unmount_all`]
#[derive(Debug, Default)]
pub struct UnmountReport {
    pub outcomes: Vec<(MountKind, Result<UnmountOutcome>)>,
}

impl UnmountReport {
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }
}

pub struct MountManager<M: Mounter> {
    root: PathBuf,
    mounter: M,
    tmp_size: String,
}

impl<M: Mounter> MountManager<M> {
    pub fn new(env: &ChrootEnvironment, mounter: M) -> Self {
        Self {
            root: env.root().to_path_buf(),
            mounter,
            tmp_size: DEFAULT_TMP_SIZE.to_string(),
        }
    }

    pub fn with_tmp_size(mut self, size: impl Into<String>) -> Self {
        self.tmp_size = size.into();
        self
    }

    pub fn mounter(&self) -> &M {
        &self.mounter
    }

    /// The mounts in the order they are applied.
    pub fn specs(&self) -> Vec<MountSpec> {
        let spec = |kind, rel: &str, options: Option<String>| MountSpec {
            kind,
            target: self.root.join(rel),
            options,
        };
        vec![
            spec(MountKind::ProcessInfo, "proc", None),
            spec(MountKind::SystemInfo, "sys", None),
            spec(MountKind::DeviceBind, "dev", None),
            spec(MountKind::Pty, "dev/pts", Some(DEVPTS_OPTIONS.to_string())),
            spec(MountKind::TempScratch, "tmp", Some(self.tmp_size.clone())),
        ]
    }

    pub fn mount_all(&self) -> MountReport {
        let mut report = MountReport::default();

        for spec in self.specs() {
            let outcome = match self.mount_one(&spec) {
                Ok(outcome) => outcome,
                Err(err) => {
                    log::warn!("{} mount at {} failed: {}", spec.kind, spec.target.display(), err);
                    MountOutcome::Failed(err)
                }
            };
            report.outcomes.push((spec.kind, outcome));
        }
        report
    }

    fn mount_one(&self, spec: &MountSpec) -> Result<MountOutcome> {
        let mounted = self.mounter.is_mounted(&spec.target).unwrap_or_else(|err| {
            log::warn!("Cannot read mount table, assuming {} is free: {}", spec.target.display(), err);
            false
        });
        if mounted {
            log::debug!("{} already mounted at {}", spec.kind, spec.target.display());
            return Ok(MountOutcome::AlreadyMounted);
        }

        if !spec.target.is_dir() {
            fs::create_dir_all(&spec.target).map_err(|source| Error::Io {
                context: format!("creating mount point {}", spec.target.display()),
                source,
            })?;
        }
        self.mounter.mount(spec)?;
        log::info!("Mounted {} at {}", spec.kind, spec.target.display());
        Ok(MountOutcome::Mounted)
    }

    /// Reverse every mount, deepest first. Never fails as a whole.
    pub fn unmount_all(&self) -> UnmountReport {
        let mut report = UnmountReport::default();

        for spec in self.specs().into_iter().rev() {
            let result = self.mounter.unmount(&spec.target);
            match &result {
                Ok(UnmountOutcome::Unmounted) => {
                    log::info!("Unmounted {} from {}", spec.kind, spec.target.display())
                }
                Ok(UnmountOutcome::Detached) => {
                    log::info!("Detached {} from {}", spec.kind, spec.target.display())
                }
                Ok(UnmountOutcome::NotMounted) => {
                    log::debug!("{} not mounted at {}", spec.kind, spec.target.display())
                }
                Err(err) => log::warn!("Unmounting {} failed: {}", spec.target.display(), err),
            }
            report.outcomes.push((spec.kind, result));
        }
        report
    }

    /// Mount points still active below the root.
    pub fn remaining(&self) -> Result<Vec<PathBuf>> {
        self.mounter.mounted_below(&self.root)
    }

    /// Unmount everything when the guard goes out of scope.
    pub fn guard(&self) -> MountGuard<'_, M> {
        MountGuard {
            manager: self,
            released: false,
        }
    }
}

/// Calls [`MountManager::unmount_all`] exactly once: on [`MountGuard::release`]
/// or, failing that, on drop.
pub struct MountGuard<'m, M: Mounter> {
    manager: &'m MountManager<M>,
    released: bool,
}

impl<M: Mounter> MountGuard<'_, M> {
    pub fn release(mut self) -> UnmountReport {
        self.released = true;
        self.manager.unmount_all()
    }
}

impl<M: Mounter> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if !self.released {
            self.manager.unmount_all();
        }
    }
}
