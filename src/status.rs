//! Status reporting for an environment and its host
//!
//! Read-only: nothing here takes the environment lock or changes state, so
//! `status` can run next to a live session.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::capabilities::{HostCapability, HostProbe};
use crate::crypt;
use crate::environment::ChrootEnvironment;
use crate::error::Result;
use crate::filter::ProcessFilter;
use crate::mount_manager::Mounter;
use crate::namespace::IsolationMethod;
use crate::registry::UserRegistry;
use crate::systemd::unit_present;

#[derive(Debug)]
pub struct StatusReport {
    pub root: PathBuf,
    pub exists: bool,
    pub initialized: bool,
    pub host: String,
    pub size: Option<u64>,
    /// Mount points currently active below the root
    pub mounts: Vec<PathBuf>,
    /// Account names, locked ones marked, or why the tables could not be read
    pub accounts: std::result::Result<Vec<String>, String>,
    /// Each method with the capabilities it lacks; empty means usable
    pub methods: Vec<(IsolationMethod, Vec<HostCapability>)>,
    pub chroot_available: bool,
    pub filter_installed: bool,
    pub resolver_available: bool,
    pub bootstrap_available: bool,
    pub unit_installed: bool,
}

impl StatusReport {
    pub fn collect<P: HostProbe, M: Mounter>(
        env: &ChrootEnvironment,
        probe: &P,
        mounter: &M,
        unit_dir: &Path,
    ) -> Result<Self> {
        let exists = env.exists();
        let initialized = exists && env.is_initialized();

        let size = if exists {
            env.size()
                .map_err(|err| log::warn!("Cannot measure {}: {}", env.root().display(), err))
                .ok()
        } else {
            None
        };
        let mounts = if exists {
            mounter.mounted_below(env.root())?
        } else {
            Vec::new()
        };
        let accounts = if initialized {
            UserRegistry::new(env)
                .list_accounts()
                .map(|records| {
                    records
                        .into_iter()
                        .filter(|r| r.is_sandbox_account())
                        .map(|r| {
                            if crypt::is_locked(&r.password_hash) {
                                format!("{} (locked)", r.username)
                            } else {
                                r.username
                            }
                        })
                        .collect()
                })
                .map_err(|err| err.to_string())
        } else {
            Ok(Vec::new())
        };

        let methods = IsolationMethod::ORDERED
            .into_iter()
            .map(|method| (method, probe.missing(method.required_capabilities())))
            .collect();

        Ok(Self {
            root: env.root().to_path_buf(),
            exists,
            initialized,
            host: env.host(),
            size,
            mounts,
            accounts,
            methods,
            chroot_available: probe.has(HostCapability::Chroot),
            filter_installed: exists && ProcessFilter::new(env).is_installed(),
            resolver_available: probe.has(HostCapability::DependencyResolver),
            bootstrap_available: probe.has(HostCapability::Bootstrap),
            unit_installed: unit_present(unit_dir),
        })
    }

    /// The method `enter` would try first on this host; `None` when `enter`
    /// would refuse outright.
    pub fn preferred_method(&self) -> Option<IsolationMethod> {
        if !self.chroot_available {
            return None;
        }
        let method = self
            .methods
            .iter()
            .find(|(_, missing)| missing.is_empty())
            .map(|(method, _)| *method)
            .unwrap_or(IsolationMethod::Unrestricted);
        Some(method)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Environment: {}", self.root.display())?;
        writeln!(f, "  Host:        {}", self.host)?;
        if !self.exists {
            writeln!(f, "  State:       not installed")?;
        } else {
            let state = if self.initialized { "initialized" } else { "incomplete (no credential tables)" };
            writeln!(f, "  State:       {}", state)?;
            if let Some(size) = self.size {
                writeln!(f, "  Size:        {}", human_size(size))?;
            }
            match &self.accounts {
                Ok(names) if names.is_empty() => writeln!(f, "  Accounts:    none")?,
                Ok(names) => writeln!(f, "  Accounts:    {}", names.join(", "))?,
                Err(reason) => writeln!(f, "  Accounts:    unreadable ({})", reason)?,
            }
            if self.mounts.is_empty() {
                writeln!(f, "  Mounts:      none")?;
            } else {
                writeln!(f, "  Mounts:")?;
                for mount in &self.mounts {
                    writeln!(f, "    {}", mount.display())?;
                }
            }
            writeln!(f, "  ps filter:   {}", on_off(self.filter_installed, "installed", "not installed"))?;
        }
        writeln!(f, "  Auto-mount:  {}", on_off(self.unit_installed, "installed", "not installed"))?;

        writeln!(f, "Isolation:")?;
        for (method, missing) in &self.methods {
            if missing.is_empty() {
                writeln!(f, "  {:<15} available", method)?;
            } else {
                let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
                writeln!(f, "  {:<15} missing {}", method, names.join(", "))?;
            }
        }
        writeln!(f, "  {:<15} {}", "chroot", on_off(self.chroot_available, "available", "MISSING (required)"))?;
        match self.preferred_method() {
            Some(method) => writeln!(f, "  Preferred:      {}", method)?,
            None => writeln!(f, "  Preferred:      none (chroot unavailable)")?,
        }

        writeln!(f, "Host tools:")?;
        writeln!(f, "  ldd:           {}", on_off(self.resolver_available, "found", "missing"))?;
        writeln!(f, "  debootstrap:   {}", on_off(self.bootstrap_available, "found", "missing"))
    }
}

fn on_off<'a>(flag: bool, yes: &'a str, no: &'a str) -> &'a str {
    if flag { yes } else { no }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::tests::FixedProbe;
    use crate::mount_manager::tests::FakeMounter;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_environment() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("absent"));
        let probe = FixedProbe::with(&[HostCapability::Chroot]);

        let report = StatusReport::collect(&env, &probe, &FakeMounter::default(), tmp.path())?;

        assert!(!report.exists);
        assert!(report.mounts.is_empty());
        assert_eq!(report.preferred_method(), Some(IsolationMethod::Unrestricted));
        assert!(report.to_string().contains("not installed"));
        Ok(())
    }

    #[test]
    fn test_no_method_without_chroot() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("absent"));
        let probe = FixedProbe::with(&[HostCapability::PrivilegeDrop]);

        let report = StatusReport::collect(&env, &probe, &FakeMounter::default(), tmp.path())?;

        assert_eq!(report.preferred_method(), None);
        assert!(report.to_string().contains("Preferred:      none (chroot unavailable)"));
        Ok(())
    }

    #[test]
    fn test_initialized_environment() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        let registry = UserRegistry::new(&env);
        registry.reset_to_baseline()?;
        registry.create_account("carol", "pw")?;
        fs::create_dir_all(env.inside("/proc")).unwrap();

        let mounter = FakeMounter::default();
        mounter.active.borrow_mut().insert(env.inside("/proc"));
        let probe = FixedProbe::with(&[HostCapability::Chroot, HostCapability::PrivilegeDrop]);

        let report = StatusReport::collect(&env, &probe, &mounter, tmp.path())?;

        assert!(report.initialized);
        assert_eq!(report.accounts, Ok(vec!["carol".to_string()]));
        assert_eq!(report.mounts, vec![env.inside("/proc")]);
        assert_eq!(report.preferred_method(), Some(IsolationMethod::BindChroot));
        let text = report.to_string();
        assert!(text.contains("Accounts:    carol"));
        assert!(text.contains("missing namespace-unshare"));
        Ok(())
    }

    #[test]
    fn test_locked_accounts_are_marked() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        let registry = UserRegistry::new(&env);
        registry.reset_to_baseline()?;
        registry.create_account("dave", "pw")?;
        registry.create_account("erin", "pw")?;

        let shadow = env.inside("/etc/shadow");
        let locked: Vec<String> = fs::read_to_string(&shadow)
            .unwrap()
            .lines()
            .map(|line| match line.split_once(':') {
                Some(("dave", rest)) => {
                    let (_, tail) = rest.split_once(':').unwrap();
                    format!("dave:!:{}", tail)
                }
                _ => line.to_string(),
            })
            .collect();
        fs::write(&shadow, locked.join("\n") + "\n").unwrap();

        let probe = FixedProbe::with(&[HostCapability::Chroot]);
        let report = StatusReport::collect(&env, &probe, &FakeMounter::default(), tmp.path())?;
        assert_eq!(
            report.accounts,
            Ok(vec!["dave (locked)".to_string(), "erin".to_string()])
        );
        Ok(())
    }

    #[test]
    fn test_corrupt_tables_are_reported() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        fs::create_dir_all(env.inside("/etc")).unwrap();
        fs::write(env.inside("/etc/passwd"), "broken line\n").unwrap();

        let report = StatusReport::collect(&env, &FixedProbe::with(&[]), &FakeMounter::default(), tmp.path())?;

        assert!(report.accounts.is_err());
        assert!(report.to_string().contains("unreadable"));
        Ok(())
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
