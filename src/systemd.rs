//! Auto-mount unit
//!
//! A oneshot service that runs `secure-chroot mount` at boot and
//! `secure-chroot unmount` at shutdown, so sessions find the pseudo
//! filesystems already in place.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{IoContext, Result};
use crate::utils::write_atomic;

pub const UNIT_NAME: &str = "secure-chroot-mounts.service";

#[derive(Debug, Clone)]
pub struct AutoMountUnit {
    exe: PathBuf,
    root: PathBuf,
    unit_dir: PathBuf,
    systemctl: Option<PathBuf>,
}

impl AutoMountUnit {
    pub fn new(exe: impl Into<PathBuf>, root: impl Into<PathBuf>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            root: root.into(),
            unit_dir: unit_dir.into(),
            systemctl: which::which("systemctl").ok(),
        }
    }

    /// Write the unit file only; never talk to the service manager.
    pub fn without_systemctl(mut self) -> Self {
        self.systemctl = None;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.unit_dir.join(UNIT_NAME)
    }

    pub fn is_installed(&self) -> bool {
        self.path().is_file()
    }

    pub fn render(&self) -> String {
        let exe = self.exe.display();
        let root = self.root.display();
        format!(
            "[Unit]\n\
             Description=secure-chroot pseudo filesystems for {root}\n\
             After=local-fs.target\n\
             RequiresMountsFor={root}\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             RemainAfterExit=yes\n\
             ExecStart={exe} --root {root} mount\n\
             ExecStop={exe} --root {root} unmount\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n"
        )
    }

    /// Write and enable the unit. Returns `false` if it was already current.
    pub fn install(&self) -> Result<bool> {
        let path = self.path();
        let rendered = self.render();
        if fs::read_to_string(&path).is_ok_and(|current| current == rendered) {
            log::debug!("{} is up to date", path.display());
            return Ok(false);
        }

        fs::create_dir_all(&self.unit_dir)
            .io_context(|| format!("creating {}", self.unit_dir.display()))?;
        write_atomic(&path, rendered.as_bytes(), 0o644)?;
        log::info!("Installed {}", path.display());

        self.systemctl(&["daemon-reload"]);
        self.systemctl(&["enable", UNIT_NAME]);
        Ok(true)
    }

    /// Disable and delete the unit. Returns `false` if there was none.
    pub fn remove(&self) -> Result<bool> {
        let path = self.path();
        if !path.exists() {
            return Ok(false);
        }

        self.systemctl(&["disable", UNIT_NAME]);
        fs::remove_file(&path).io_context(|| format!("removing {}", path.display()))?;
        self.systemctl(&["daemon-reload"]);
        log::info!("Removed {}", path.display());
        Ok(true)
    }

    /// Best effort: the unit file is what matters, the manager may be absent.
    fn systemctl(&self, args: &[&str]) {
        let Some(program) = &self.systemctl else {
            return;
        };
        match Command::new(program).args(args).output() {
            Ok(out) if out.status.success() => {
                log::debug!("systemctl {} succeeded", args.join(" "))
            }
            Ok(out) => log::warn!(
                "systemctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(err) => log::warn!("Could not run {}: {}", program.display(), err),
        }
    }
}

/// Path of the running executable, for the unit's Exec lines.
pub fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().io_context(|| "locating the secure-chroot executable")
}

/// Whether `dir` holds a unit file for this tool.
pub fn unit_present(dir: &Path) -> bool {
    dir.join(UNIT_NAME).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn unit(tmp: &TempDir) -> AutoMountUnit {
        AutoMountUnit::new("/usr/local/bin/secure-chroot", "/opt/secure_chroot", tmp.path().join("units"))
            .without_systemctl()
    }

    #[test]
    fn test_render_runs_mount_and_unmount() {
        let tmp = TempDir::new().unwrap();
        let text = unit(&tmp).render();
        assert!(text.contains("Type=oneshot"));
        assert!(text.contains("RemainAfterExit=yes"));
        assert!(text.contains(
            "ExecStart=/usr/local/bin/secure-chroot --root /opt/secure_chroot mount\n"
        ));
        assert!(text.contains(
            "ExecStop=/usr/local/bin/secure-chroot --root /opt/secure_chroot unmount\n"
        ));
        assert!(text.contains("RequiresMountsFor=/opt/secure_chroot"));
    }

    #[test]
    fn test_install_and_remove() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let unit = unit(&tmp);

        assert!(unit.install()?);
        assert!(!unit.install()?);
        assert!(unit_present(&tmp.path().join("units")));
        let mode = fs::metadata(unit.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        assert!(unit.remove()?);
        assert!(!unit.is_installed());
        assert!(!unit.remove()?);
        Ok(())
    }
}
