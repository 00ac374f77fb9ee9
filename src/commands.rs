//! Command orchestration
//!
//! Each subcommand is a thin sequence over the library components. Mutating
//! commands run as root and hold the environment lock for their whole
//! duration; `status` does neither.

use std::fs;
use std::path::Path;

use eyre::{Context, Result};
use nix::unistd::geteuid;

use crate::builder::FilesystemBuilder;
use crate::capabilities::{HostCapability, HostProbe, SystemProbe};
use crate::cli::{Args, Command, FilterAction};
use crate::config::{Settings, check_free_space};
use crate::deps::LddResolver;
use crate::environment::{ChrootEnvironment, EnvironmentLock};
use crate::error::Error;
use crate::filter::ProcessFilter;
use crate::launcher::ForkLauncher;
use crate::mount_manager::{MountManager, Mounter, SystemMounter};
use crate::prompt;
use crate::registry::UserRegistry;
use crate::session::SessionEngine;
use crate::status::StatusReport;
use crate::systemd::{AutoMountUnit, current_exe};

/// Entries under the root that survive a rebuild
const PRESERVED_ON_REBUILD: &[&str] = &["home"];

pub fn run(args: &Args) -> Result<()> {
    let settings = Settings::from_args(args)?;
    log::debug!("Settings: {:?}", settings);

    match &args.command {
        Command::Install { user, password, .. } => {
            install(&settings, user.as_deref(), password.as_deref())
        }
        Command::Enter { username, .. } => enter(&settings, username),
        Command::Status => status(&settings),
        Command::Cleanup { yes } => cleanup(&settings, *yes),
        Command::Repair => repair(&settings),
        Command::Rebuild { yes } => rebuild(&settings, *yes),
        Command::EnhanceIsolation { action } => enhance_isolation(&settings, *action),
        Command::AddUser { username, password } => {
            add_user(&settings, username, password.as_deref())
        }
        Command::Passwd { username, password } => passwd(&settings, username, password.as_deref()),
        Command::Mount => mount(&settings),
        Command::Unmount => unmount(&settings),
    }
}

fn install(settings: &Settings, user: Option<&str>, password: Option<&str>) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = env.lock()?;

    let initialized = env.is_initialized();
    if initialized {
        log::warn!(
            "{} is already initialized; refreshing binaries and keeping accounts",
            env.root().display()
        );
    } else {
        check_free_space(env.root(), settings.min_free_bytes)?;
    }
    if !LddResolver::available() {
        log::warn!("ldd not found; binaries will be copied without their libraries");
    }

    let builder = FilesystemBuilder::new(&env, LddResolver::new())
        .with_closure_mode(settings.closure_mode);
    builder.layout_skeleton()?;
    let report = builder.materialize(&settings.binaries)?;
    if !report.missing.is_empty() {
        log::warn!("Not found on this host: {}", report.missing.join(", "));
    }
    for soname in &report.unresolved {
        log::warn!("Library {} could not be resolved; some binaries may not run", soname);
    }
    if !initialized {
        builder.provision_baseline_config()?;
    }
    provision_devices(&builder)?;

    let registry = UserRegistry::new(&env);
    let created = match user {
        Some(name) if initialized && registry.find(name).is_ok() => {
            log::warn!("Account {} already exists; leaving it unchanged", name);
            None
        }
        Some(name) => Some(create(&registry, name, password)?),
        None if initialized => None,
        None => {
            let name = prompt::prompt_line("Username for the sandbox account: ")?;
            Some(create(&registry, name.trim(), password)?)
        }
    };

    let unit = AutoMountUnit::new(current_exe()?, env.root(), &settings.unit_dir);
    if let Err(err) = unit.install() {
        log::warn!("Auto-mount unit not installed: {}", err);
    }

    println!(
        "Installed {} ({} binaries, {} libraries)",
        env.root().display(),
        report.binaries.len(),
        report.libraries.len()
    );
    if let Some(name) = created {
        println!("Enter it with: secure-chroot --root {} enter {}", env.root().display(), name);
    }
    Ok(())
}

fn create(registry: &UserRegistry<'_>, name: &str, password: Option<&str>) -> Result<String> {
    let password = match password {
        Some(p) => p.to_string(),
        None => prompt::prompt_new_password(name)?,
    };
    let record = registry.create_account(name, &password)?;
    println!("Created account {} (uid {})", record.username, record.uid);
    Ok(record.username)
}

fn enter(settings: &Settings, username: &str) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;
    log::info!("Host capabilities: {}", probe_summary(&SystemProbe));

    let engine = SessionEngine::new(&env, SystemProbe, ForkLauncher, SystemMounter)
        .with_timeout(settings.session_timeout)
        .with_tmp_size(settings.tmp_size.as_str());
    let report = engine
        .enter(username)
        .wrap_err_with(|| format!("Failed to enter {} as {}", env.root().display(), username))?;

    // The shell's own status is not ours; a completed session exits 0
    eprintln!();
    eprint!("{}", report);
    Ok(())
}

fn status(settings: &Settings) -> Result<()> {
    let env = settings.environment();
    let report = StatusReport::collect(&env, &SystemProbe, &SystemMounter, &settings.unit_dir)?;
    print!("{}", report);
    Ok(())
}

fn cleanup(settings: &Settings, yes: bool) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    require_exists(&env)?;
    if !yes
        && !prompt::confirm(&format!(
            "Delete {} and every account in it?",
            env.root().display()
        ))?
    {
        return Err(Error::precondition("cleanup not confirmed").into());
    }

    let lock = env.lock()?;
    release_mounts(&env, settings)?;
    ProcessFilter::new(&env).remove()?;

    let unit = AutoMountUnit::new(current_exe()?, env.root(), &settings.unit_dir);
    if let Err(err) = unit.remove() {
        log::warn!("Auto-mount unit not removed: {}", err);
    }

    fs::remove_dir_all(env.root())
        .wrap_err_with(|| format!("Failed to delete {}", env.root().display()))?;
    drop(lock);
    if let Err(err) = fs::remove_file(env.lock_path()) {
        log::debug!("Lock file {} not removed: {}", env.lock_path().display(), err);
    }

    println!("Removed {}", env.root().display());
    Ok(())
}

fn repair(settings: &Settings) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;

    let builder = FilesystemBuilder::new(&env, LddResolver::new())
        .with_closure_mode(settings.closure_mode);
    builder.layout_skeleton()?;
    builder.repair_permissions()?;
    let report = builder.materialize(&settings.binaries)?;
    if !env.is_initialized() {
        log::warn!("Credential tables missing; restoring the baseline");
        builder.provision_baseline_config()?;
    }
    provision_devices(&builder)?;

    let registry = UserRegistry::new(&env);
    let accounts = registry
        .list_accounts()
        .wrap_err("Credential tables are corrupt; repair cannot fix them, rebuild or restore them")?;
    for account in accounts.iter().filter(|a| a.is_sandbox_account()) {
        registry.prepare_home(&account.username, account.uid, account.gid)?;
    }

    println!(
        "Repaired {} ({} files rewritten)",
        env.root().display(),
        report.fresh_copies
    );
    Ok(())
}

fn rebuild(settings: &Settings, yes: bool) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    require_exists(&env)?;
    if !yes
        && !prompt::confirm(&format!(
            "Rebuild {}? Everything outside /home is recreated.",
            env.root().display()
        ))?
    {
        return Err(Error::precondition("rebuild not confirmed").into());
    }

    let _lock = env.lock()?;
    let registry = UserRegistry::new(&env);
    let exports = if env.is_initialized() {
        registry.export_accounts()?
    } else {
        Vec::new()
    };
    let filter = ProcessFilter::new(&env);
    let had_filter = filter.is_installed();

    release_mounts(&env, settings)?;
    clear_root(env.root())?;

    let builder = FilesystemBuilder::new(&env, LddResolver::new())
        .with_closure_mode(settings.closure_mode);
    builder.layout_skeleton()?;
    builder.materialize(&settings.binaries)?;
    builder.provision_baseline_config()?;
    provision_devices(&builder)?;

    for export in &exports {
        registry
            .import_account(export)
            .wrap_err_with(|| format!("Failed to restore account {}", export.record.username))?;
    }
    if had_filter {
        filter.install()?;
    }

    println!(
        "Rebuilt {} ({} accounts restored)",
        env.root().display(),
        exports.len()
    );
    Ok(())
}

fn enhance_isolation(settings: &Settings, action: FilterAction) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;
    let filter = ProcessFilter::new(&env);

    match action {
        FilterAction::Enhance => {
            if filter.install()? {
                println!("Process filter installed at {}", filter.target().display());
            } else {
                println!("Process filter already installed");
            }
            println!("Note: the filter is cosmetic; /proc inside the sandbox stays readable.");
        }
        FilterAction::Remove => {
            if filter.remove()? {
                println!("Process filter removed; original ps restored");
            } else {
                println!("Process filter was not installed");
            }
        }
    }
    Ok(())
}

fn add_user(settings: &Settings, username: &str, password: Option<&str>) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;
    require_initialized(&env)?;

    create(&UserRegistry::new(&env), username, password)?;
    Ok(())
}

fn passwd(settings: &Settings, username: &str, password: Option<&str>) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;
    require_initialized(&env)?;

    let registry = UserRegistry::new(&env);
    registry.find(username)?;
    let password = match password {
        Some(p) => p.to_string(),
        None => prompt::prompt_new_password(username)?,
    };
    registry.set_password(username, &password)?;
    println!("Password updated for {}", username);
    Ok(())
}

fn mount(settings: &Settings) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;

    let manager = MountManager::new(&env, SystemMounter).with_tmp_size(settings.tmp_size.as_str());
    let report = manager.mount_all();
    print!("{}", report);
    if report.failures() > 0 {
        log::warn!("{} mounts failed; sessions will be degraded", report.failures());
    }
    Ok(())
}

fn unmount(settings: &Settings) -> Result<()> {
    require_root()?;
    let env = settings.environment();
    let _lock = lock_existing(&env)?;

    let manager = MountManager::new(&env, SystemMounter);
    manager.unmount_all();
    let remaining = manager.remaining()?;
    if remaining.is_empty() {
        println!("No mounts left below {}", env.root().display());
    } else {
        for path in &remaining {
            log::warn!("Still mounted: {}", path.display());
        }
    }
    Ok(())
}

fn require_root() -> Result<()> {
    if !geteuid().is_root() {
        return Err(Error::precondition("this command must be run as root").into());
    }
    Ok(())
}

fn require_exists(env: &ChrootEnvironment) -> Result<()> {
    if !env.exists() {
        return Err(Error::precondition(format!(
            "environment {} does not exist; run install first",
            env.root().display()
        ))
        .into());
    }
    Ok(())
}

fn require_initialized(env: &ChrootEnvironment) -> Result<()> {
    if !env.is_initialized() {
        return Err(Error::precondition(format!(
            "environment {} has no credential tables; run install or repair",
            env.root().display()
        ))
        .into());
    }
    Ok(())
}

fn lock_existing(env: &ChrootEnvironment) -> Result<EnvironmentLock> {
    require_exists(env)?;
    Ok(env.lock()?)
}

fn provision_devices<R: crate::deps::DependencyResolver>(
    builder: &FilesystemBuilder<'_, R>,
) -> Result<()> {
    let devices = builder.provision_device_nodes()?;
    if !devices.failed.is_empty() {
        log::warn!(
            "{} device nodes could not be created; the sandbox may lack them",
            devices.failed.len()
        );
    }
    Ok(())
}

/// Unmount everything, then refuse to go on if anything is still mounted.
fn release_mounts(env: &ChrootEnvironment, settings: &Settings) -> Result<()> {
    release_mounts_with(env, SystemMounter, settings)
}

fn release_mounts_with<M: Mounter>(env: &ChrootEnvironment, mounter: M, settings: &Settings) -> Result<()> {
    let manager = MountManager::new(env, mounter).with_tmp_size(settings.tmp_size.as_str());
    manager.unmount_all();
    let remaining = manager.remaining()?;
    if !remaining.is_empty() {
        let list: Vec<String> = remaining.iter().map(|p| p.display().to_string()).collect();
        return Err(Error::precondition(format!(
            "refusing to delete files while still mounted: {}",
            list.join(", ")
        ))
        .into());
    }
    Ok(())
}

/// Delete every top-level entry except the preserved ones.
fn clear_root(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root).wrap_err_with(|| format!("Failed to list {}", root.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if PRESERVED_ON_REBUILD.iter().any(|keep| name == *keep) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.wrap_err_with(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// One line naming the host capabilities this host lacks.
pub fn probe_summary<P: HostProbe>(probe: &P) -> String {
    let missing = probe.missing(&HostCapability::ALL);
    if missing.is_empty() {
        "all host capabilities present".to_string()
    } else {
        let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
        format!("missing: {}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::tests::FixedProbe;
    use crate::mount_manager::tests::FakeMounter;
    use clap::Parser;
    use tempfile::TempDir;

    fn settings_for(root: &Path) -> Settings {
        let root = root.to_string_lossy().into_owned();
        let args = Args::try_parse_from(["secure-chroot", "--root", root.as_str(), "status"]).unwrap();
        Settings::from_args(&args).unwrap()
    }

    #[test]
    fn test_clear_root_keeps_home() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("home/alice")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("home/alice/notes"), "keep").unwrap();
        fs::write(root.join("stray"), "").unwrap();

        clear_root(&root)?;

        let names: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("home")]);
        assert_eq!(fs::read_to_string(root.join("home/alice/notes")).unwrap(), "keep");
        Ok(())
    }

    #[test]
    fn test_release_refuses_while_mounted() {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        let settings = settings_for(env.root());

        // A foreign mount the manager does not own survives unmount_all
        let mounter = FakeMounter::default();
        mounter.active.borrow_mut().insert(env.inside("/mnt/host"));

        let err = release_mounts_with(&env, &mounter, &settings).unwrap_err();
        assert!(err.to_string().contains("/mnt/host"));
    }

    #[test]
    fn test_release_after_own_mounts() -> Result<()> {
        let tmp = TempDir::new().unwrap();
        let env = ChrootEnvironment::new(tmp.path().join("root"));
        let settings = settings_for(env.root());

        let mounter = FakeMounter::default();
        mounter.active.borrow_mut().insert(env.inside("/proc"));
        mounter.active.borrow_mut().insert(env.inside("/dev/pts"));

        release_mounts_with(&env, &mounter, &settings)?;
        assert!(mounter.active.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn test_probe_summary() {
        assert_eq!(
            probe_summary(&FixedProbe::with(&HostCapability::ALL)),
            "all host capabilities present"
        );
        let summary = probe_summary(&FixedProbe::with(&[HostCapability::Chroot]));
        assert!(summary.starts_with("missing: namespace-unshare"));
    }
}
