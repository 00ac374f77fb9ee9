//! Filesystem mount operations and the kernel mount table

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoContext, Result};

fn failed(target: &Path) -> impl FnOnce(Errno) -> Error + '_ {
    move |source| Error::MountFailed {
        target: target.to_path_buf(),
        source,
    }
}

/// Mount proc filesystem
pub fn mount_proc<P: AsRef<Path>>(target: P) -> Result<()> {
    let target = target.as_ref();
    log::debug!("Mounting proc filesystem at {}", target.display());
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(failed(target))?;
    log::debug!("Successfully mounted proc filesystem");
    Ok(())
}

/// Mount sysfs filesystem
pub fn mount_sysfs<P: AsRef<Path>>(target: P) -> Result<()> {
    let target = target.as_ref();
    log::debug!("Mounting sysfs at {}", target.display());
    mount(
        Some("sysfs"),
        target,
        Some("sysfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(failed(target))?;
    log::debug!("Successfully mounted sysfs");
    Ok(())
}

/// Mount tmpfs filesystem
pub fn mount_tmpfs<P: AsRef<Path>>(target: P, mode: u32, size: Option<&str>) -> Result<()> {
    let target = target.as_ref();
    let options = tmpfs_options(mode, size);

    log::debug!(
        "Mounting tmpfs at {} with options: {}",
        target.display(),
        options
    );
    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .map_err(failed(target))?;
    log::debug!("Successfully mounted tmpfs");
    Ok(())
}

fn tmpfs_options(mode: u32, size: Option<&str>) -> String {
    match size {
        Some(s) => format!("size={},mode={:o}", s, mode),
        None => format!("mode={:o}", mode),
    }
}

/// Mount devpts filesystem
///
/// Every devpts mount is a new instance (Linux 4.7+). Opening `/dev/ptmx`
/// allocates from the `pts` directory beside it, so ptys opened through the
/// sandbox's `/dev/ptmx` land in this instance and not the host's.
pub fn mount_devpts<P: AsRef<Path>>(target: P, options: &str) -> Result<()> {
    let target = target.as_ref();
    log::debug!("Mounting devpts at {} ({})", target.display(), options);
    mount(
        Some("devpts"),
        target,
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some(options),
    )
    .map_err(failed(target))?;
    log::debug!("Successfully mounted devpts");
    Ok(())
}

/// Make mount point private (don't propagate mounts)
pub fn make_private<P: AsRef<Path>>(target: P) -> Result<()> {
    let target = target.as_ref();
    log::debug!("Making {} private", target.display());
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(failed(target))?;
    Ok(())
}

/// What an unmount request found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    /// The target was busy and has been lazily detached
    Detached,
    NotMounted,
}

/// Unmount filesystem. A target that is not mounted (or does not exist) is
/// not an error; a busy one is retried with a lazy detach.
pub fn unmount<P: AsRef<Path>>(target: P) -> Result<UnmountOutcome> {
    let target = target.as_ref();
    match umount2(target, MntFlags::empty()) {
        Ok(()) => Ok(UnmountOutcome::Unmounted),
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(UnmountOutcome::NotMounted),
        Err(Errno::EBUSY) => {
            log::warn!("{} is busy, detaching lazily", target.display());
            umount2(target, MntFlags::MNT_DETACH).map_err(failed(target))?;
            Ok(UnmountOutcome::Detached)
        }
        Err(errno) => Err(failed(target)(errno)),
    }
}

/// A snapshot of this process's mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mount_points: Vec<PathBuf>,
}

impl MountTable {
    pub fn read() -> Result<Self> {
        let content = fs::read_to_string("/proc/self/mountinfo")
            .io_context(|| "reading /proc/self/mountinfo")?;
        Ok(Self::parse(&content))
    }

    /// Parse mountinfo(5) text; the fifth field is the mount point.
    pub fn parse(content: &str) -> Self {
        let mount_points = content
            .lines()
            .filter_map(|line| line.split(' ').nth(4))
            .map(|field| PathBuf::from(unescape(field)))
            .collect();
        Self { mount_points }
    }

    /// `path` is compared by its real path, as the kernel reports it.
    pub fn is_mount_point(&self, path: &Path) -> bool {
        let path = real_path(path);
        self.mount_points.iter().any(|m| *m == path)
    }

    /// Mount points at or below `root`, deepest first, as real paths.
    pub fn below(&self, root: &Path) -> Vec<PathBuf> {
        let root = real_path(root);
        let mut found: Vec<PathBuf> = self
            .mount_points
            .iter()
            .filter(|m| m.starts_with(&root))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        found.dedup();
        found
    }
}

/// Resolve symlinks in the longest existing prefix of `path` and keep the
/// rest as given.
pub fn real_path(path: &Path) -> PathBuf {
    for existing in path.ancestors() {
        let Ok(real) = fs::canonicalize(existing) else {
            continue;
        };
        return match path.strip_prefix(existing) {
            Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
            _ => real,
        };
    }
    path.to_path_buf()
}

/// Undo the `\ooo` octal escapes the kernel applies to space, tab,
/// newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
