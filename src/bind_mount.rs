//! Bind mounts of host trees into the sandbox

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::Path;

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// What a bind keeps from its source
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindOptions: u32 {
        /// Keep device nodes usable; otherwise the bind is nodev
        const DEVICES = 1 << 0;
        const NO_SUID = 1 << 1;
        const NO_EXEC = 1 << 2;
    }
}

impl BindOptions {
    /// Flags for the follow-up remount, if the bind needs restricting.
    ///
    /// The kernel ignores restrictions passed with the initial MS_BIND, and a
    /// second remount resets the first, so all of them go into one call.
    fn remount_flags(self) -> Option<MsFlags> {
        let mut flags = MsFlags::empty();
        if !self.contains(BindOptions::DEVICES) {
            flags |= MsFlags::MS_NODEV;
        }
        if self.contains(BindOptions::NO_SUID) {
            flags |= MsFlags::MS_NOSUID;
        }
        if self.contains(BindOptions::NO_EXEC) {
            flags |= MsFlags::MS_NOEXEC;
        }
        (!flags.is_empty()).then_some(flags | MsFlags::MS_BIND | MsFlags::MS_REMOUNT)
    }
}

/// How the host `/dev` is exposed: device nodes work, nothing on it runs
pub const DEV_BIND: BindOptions = BindOptions::DEVICES
    .union(BindOptions::NO_SUID)
    .union(BindOptions::NO_EXEC);

/// Expose the host tree `source` at `target`. A missing source is a
/// precondition failure, not a mount failure.
pub fn bind_mount<P: AsRef<Path>, Q: AsRef<Path>>(source: P, target: Q, options: BindOptions) -> Result<()> {
    let source = source.as_ref();
    let target = target.as_ref();

    if !source.exists() {
        return Err(Error::precondition(format!(
            "bind source {} does not exist on this host",
            source.display()
        )));
    }
    let failed = |source: nix::Error| Error::MountFailed {
        target: target.to_path_buf(),
        source,
    };

    log::debug!("Binding {} at {} ({:?})", source.display(), target.display(), options);
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(failed)?;

    if let Some(flags) = options.remount_flags() {
        if let Err(errno) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
            // An unrestricted bind must not stay behind
            let _ = umount2(target, MntFlags::MNT_DETACH);
            return Err(failed(errno));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_source_is_a_precondition() {
        let tmp = TempDir::new().unwrap();
        let result = bind_mount("/nonexistent/dev", tmp.path(), DEV_BIND);
        assert!(matches!(result, Err(Error::PreconditionFailed(_))));
    }

    #[test]
    fn test_remount_flags() {
        assert_eq!(BindOptions::DEVICES.remount_flags(), None);

        let dev = DEV_BIND.remount_flags().unwrap();
        assert!(dev.contains(MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_REMOUNT));
        assert!(!dev.contains(MsFlags::MS_NODEV));

        let plain = BindOptions::empty().remount_flags().unwrap();
        assert!(plain.contains(MsFlags::MS_NODEV | MsFlags::MS_BIND));
    }

    #[test]
    fn test_unprivileged_bind_fails_typed() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let target = tmp.path().join("target");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&target).unwrap();

        let result = bind_mount(&source, &target, DEV_BIND);
        assert!(matches!(result, Err(Error::MountFailed { target: t, .. }) if t == target));
    }
}
