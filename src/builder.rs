//! Filesystem builder: directory skeleton, binaries with their library
//! closure, baseline configuration and device nodes

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{Mode, SFlag, makedev, mknod};

use crate::deps::{ClosureMode, DependencyResolver, library_closure};
use crate::environment::ChrootEnvironment;
use crate::error::{Error, IoContext, Result};
use crate::filter::ProcessFilter;
use crate::mount::MountTable;
use crate::registry::UserRegistry;
use crate::utils::{copy_atomic, ensure_dir, mirror_path};

/// Executables installed by default
pub const DEFAULT_BINARIES: &[&str] = &[
    "/bin/bash",
    "/bin/sh",
    "/bin/ls",
    "/bin/cat",
    "/bin/cp",
    "/bin/mv",
    "/bin/rm",
    "/bin/mkdir",
    "/bin/rmdir",
    "/bin/touch",
    "/bin/chmod",
    "/bin/echo",
    "/bin/pwd",
    "/bin/grep",
    "/bin/sed",
    "/bin/ps",
    "/usr/bin/id",
    "/usr/bin/whoami",
    "/usr/bin/head",
    "/usr/bin/tail",
    "/usr/bin/less",
    "/usr/bin/env",
    "/usr/bin/clear",
    "/usr/bin/nano",
    "/usr/bin/vi",
];

/// Host configuration files copied verbatim when present
const CONFIG_WHITELIST: &[&str] = &[
    "/etc/nsswitch.conf",
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/resolv.conf",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/profile",
    "/etc/bash.bashrc",
    "/etc/inputrc",
    "/etc/localtime",
    "/lib/terminfo/x/xterm",
    "/lib/terminfo/x/xterm-256color",
    "/usr/share/terminfo/x/xterm",
    "/usr/share/terminfo/x/xterm-256color",
];

/// (relative path, mode) of every directory in a fresh environment
const SKELETON: &[(&str, u32)] = &[
    ("bin", 0o755),
    ("sbin", 0o755),
    ("lib", 0o755),
    ("lib64", 0o755),
    ("usr", 0o755),
    ("usr/bin", 0o755),
    ("usr/sbin", 0o755),
    ("usr/lib", 0o755),
    ("usr/local", 0o755),
    ("usr/local/bin", 0o755),
    ("etc", 0o755),
    ("dev", 0o755),
    ("dev/pts", 0o755),
    ("proc", 0o555),
    ("sys", 0o555),
    ("tmp", 0o1777),
    ("home", 0o755),
    ("root", 0o700),
    ("var", 0o755),
    ("var/log", 0o755),
    ("var/tmp", 0o1777),
    ("run", 0o755),
];

/// A character device the sandbox needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: &'static str,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

pub const DEVICE_NODES: &[DeviceNode] = &[
    DeviceNode { name: "null", major: 1, minor: 3, mode: 0o666 },
    DeviceNode { name: "zero", major: 1, minor: 5, mode: 0o666 },
    DeviceNode { name: "random", major: 1, minor: 8, mode: 0o666 },
    DeviceNode { name: "urandom", major: 1, minor: 9, mode: 0o666 },
    DeviceNode { name: "tty", major: 5, minor: 0, mode: 0o666 },
    DeviceNode { name: "console", major: 5, minor: 1, mode: 0o600 },
    DeviceNode { name: "ptmx", major: 5, minor: 2, mode: 0o666 },
];

/// Outcome of [`FilesystemBuilder::materialize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Host paths of the binaries now present in the sandbox
    pub binaries: BTreeSet<PathBuf>,
    /// Host paths of the libraries now present in the sandbox
    pub libraries: BTreeSet<PathBuf>,
    /// Requested binaries not found on the host
    pub missing: Vec<String>,
    /// Sonames the resolver could not locate
    pub unresolved: BTreeSet<String>,
    /// Files actually (re)written by this run
    pub fresh_copies: usize,
}

impl MaterializeReport {
    /// Every file this report accounts for, relative to nothing in particular
    /// but comparable across runs.
    pub fn copied(&self) -> BTreeSet<PathBuf> {
        self.binaries.union(&self.libraries).cloned().collect()
    }
}

/// Outcome of [`FilesystemBuilder::provision_device_nodes`]
#[derive(Debug, Default)]
pub struct DeviceReport {
    pub created: Vec<&'static str>,
    pub existing: Vec<&'static str>,
    /// Warnings only; the builder carries on without these nodes
    pub failed: Vec<Error>,
    pub skipped_reason: Option<String>,
}

pub struct FilesystemBuilder<'a, R: DependencyResolver> {
    env: &'a ChrootEnvironment,
    resolver: R,
    mode: ClosureMode,
}

impl<'a, R: DependencyResolver> FilesystemBuilder<'a, R> {
    pub fn new(env: &'a ChrootEnvironment, resolver: R) -> Self {
        Self {
            env,
            resolver,
            mode: ClosureMode::default(),
        }
    }

    pub fn with_closure_mode(mut self, mode: ClosureMode) -> Self {
        self.mode = mode;
        self
    }

    /// Create the fixed directory tree with its modes.
    pub fn layout_skeleton(&self) -> Result<()> {
        let root = self.env.root();
        log::info!("Laying out directory skeleton in {}", root.display());
        ensure_dir(root, 0o755)?;

        for (dir, mode) in SKELETON
            .iter()
            .copied()
            .chain(multiarch_dirs().iter().map(|d| (d.as_str(), 0o755)))
        {
            ensure_dir(root.join(dir), mode)?;
        }
        Ok(())
    }

    /// Copy each binary and its library closure to mirrored paths.
    pub fn materialize<S: AsRef<str>>(&self, binaries: &[S]) -> Result<MaterializeReport> {
        let mut report = MaterializeReport::default();
        let mut present = Vec::new();

        for requested in binaries {
            let requested = requested.as_ref();
            match locate_binary(requested) {
                Some(path) => present.push(path),
                None => {
                    log::warn!("Binary {} not found on host; skipping", requested);
                    report.missing.push(requested.to_string());
                }
            }
        }
        present.sort();
        present.dedup();

        // An installed filter owns the `ps` slot; refresh its backup instead
        let filter = ProcessFilter::new(self.env);
        let shim = filter.is_installed().then(|| (filter.target(), filter.backup()));

        for binary in &present {
            if self.install_file(binary, shim.as_ref())? {
                report.fresh_copies += 1;
            }
            report.binaries.insert(mirror_path(self.env.root(), binary));
        }

        let closure = library_closure(&self.resolver, &present, self.mode)?;
        for lib in &closure.libraries {
            if !lib.exists() {
                log::warn!("Resolved library {} vanished from host", lib.display());
                continue;
            }
            if self.install_file(lib, None)? {
                report.fresh_copies += 1;
            }
            report.libraries.insert(mirror_path(self.env.root(), lib));
        }
        report.unresolved = closure.unresolved;

        log::info!(
            "Materialized {} binaries and {} libraries ({} written, {} missing)",
            report.binaries.len(),
            report.libraries.len(),
            report.fresh_copies,
            report.missing.len()
        );
        Ok(report)
    }

    /// Copy the configuration whitelist and reset the credential tables.
    pub fn provision_baseline_config(&self) -> Result<Vec<PathBuf>> {
        let mut copied = Vec::new();
        for file in CONFIG_WHITELIST {
            let source = Path::new(file);
            if !source.exists() {
                log::debug!("Host has no {}; skipping", file);
                continue;
            }
            let dest = mirror_path(self.env.root(), source);
            copy_atomic(source, &dest)?;
            copied.push(dest);
        }

        UserRegistry::new(self.env).reset_to_baseline()?;
        Ok(copied)
    }

    /// Create the character devices. Failures are warnings.
    pub fn provision_device_nodes(&self) -> Result<DeviceReport> {
        let dev = self.env.inside("/dev");
        let mut report = DeviceReport::default();

        if MountTable::read()?.is_mount_point(&dev) {
            let reason = format!("{} is a mount point; not touching host devices", dev.display());
            log::warn!("Skipping device nodes: {}", reason);
            report.skipped_reason = Some(reason);
            return Ok(report);
        }
        ensure_dir(&dev, 0o755)?;

        for node in DEVICE_NODES {
            let path = dev.join(node.name);
            if fs::symlink_metadata(&path).is_ok() {
                report.existing.push(node.name);
                continue;
            }

            match create_device(&path, node) {
                Ok(()) => {
                    log::debug!("Created {} ({}, {})", path.display(), node.major, node.minor);
                    report.created.push(node.name);
                }
                Err(err) => {
                    log::warn!("{}", err);
                    report.failed.push(err);
                }
            }
        }
        Ok(report)
    }

    /// Re-apply skeleton modes; used by repair.
    pub fn repair_permissions(&self) -> Result<()> {
        for (dir, mode) in SKELETON {
            let path = self.env.root().join(dir);
            if path.is_dir() {
                fs::set_permissions(&path, fs::Permissions::from_mode(*mode))
                    .io_context(|| format!("chmod {:o} {}", mode, path.display()))?;
            }
        }
        Ok(())
    }

    fn install_file(&self, host_path: &Path, shim: Option<&(PathBuf, PathBuf)>) -> Result<bool> {
        let mut dest = mirror_path(self.env.root(), host_path);
        if let Some((target, backup)) = shim
            && dest == *target
        {
            log::debug!("{} is the process filter; refreshing {}", dest.display(), backup.display());
            dest = backup.clone();
        }
        let written = copy_atomic(host_path, &dest)?;
        if written {
            log::debug!("Copied {} -> {}", host_path.display(), dest.display());
        }
        Ok(written)
    }
}

fn create_device(path: &Path, node: &DeviceNode) -> Result<()> {
    mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(node.mode),
        makedev(node.major, node.minor),
    )
    .map_err(|source| Error::DeviceNodeCreateFailed {
        node: path.to_path_buf(),
        source,
    })?;

    // mknod honours the umask
    fs::set_permissions(path, fs::Permissions::from_mode(node.mode))
        .io_context(|| format!("chmod {:o} {}", node.mode, path.display()))
}

/// Resolve a requested binary to a host path: absolute paths as given
/// (with the usr-merged twin as fallback), bare names through `PATH`.
fn locate_binary(requested: &str) -> Option<PathBuf> {
    let path = Path::new(requested);
    if path.is_absolute() {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        let twin = match requested.strip_prefix("/usr") {
            Some(rest) => PathBuf::from(rest),
            None => Path::new("/usr").join(path.strip_prefix("/").ok()?),
        };
        return twin.is_file().then_some(twin);
    }
    which::which(requested).ok()
}

/// Whether two requests name the same binary: the same host file under the
/// same command name, however each was spelled.
pub fn same_binary(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let identity = |requested: &str| {
        let path = locate_binary(requested)?;
        let name = path.file_name()?.to_os_string();
        Some((name, fs::canonicalize(&path).ok()?))
    };
    match (identity(a), identity(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Multiarch library directories for the host architecture (Debian layout).
fn multiarch_dirs() -> Vec<String> {
    let triplet = match std::env::consts::ARCH {
        "x86_64" => "x86_64-linux-gnu",
        "aarch64" => "aarch64-linux-gnu",
        "arm" => "arm-linux-gnueabihf",
        "x86" => "i386-linux-gnu",
        "riscv64" => "riscv64-linux-gnu",
        "powerpc64" => "powerpc64le-linux-gnu",
        "s390x" => "s390x-linux-gnu",
        _ => return Vec::new(),
    };
    vec![format!("lib/{}", triplet), format!("usr/lib/{}", triplet)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::Dependencies;
    use std::collections::HashMap;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    struct MapResolver(HashMap<PathBuf, Vec<PathBuf>>);

    impl DependencyResolver for MapResolver {
        fn dependencies(&self, object: &Path) -> Result<Dependencies> {
            Ok(Dependencies {
                resolved: self.0.get(object).cloned().unwrap_or_default(),
                unresolved: Vec::new(),
            })
        }
    }

    struct Fixture {
        _tmp: TempDir,
        host: PathBuf,
        env: ChrootEnvironment,
    }

    /// A fake "host" tree with one binary depending on two libraries
    fn fixture() -> (Fixture, MapResolver) {
        let tmp = TempDir::new().unwrap();
        let host = tmp.path().join("host");
        for (file, body) in [
            ("bin/tool", "tool"),
            ("lib/liba.so", "liba"),
            ("lib/libb.so", "libb"),
        ] {
            let path = host.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut graph = HashMap::new();
        graph.insert(host.join("bin/tool"), vec![host.join("lib/liba.so")]);
        graph.insert(host.join("lib/liba.so"), vec![host.join("lib/libb.so")]);

        let env = ChrootEnvironment::new(tmp.path().join("root"));
        (
            Fixture {
                _tmp: tmp,
                host,
                env,
            },
            MapResolver(graph),
        )
    }

    #[test]
    fn test_layout_skeleton_modes() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        builder.layout_skeleton()?;

        let mode = |p: &str| fs::metadata(fx.env.root().join(p)).unwrap().mode() & 0o7777;
        assert_eq!(mode(""), 0o755);
        assert_eq!(mode("tmp"), 0o1777);
        assert_eq!(mode("root"), 0o700);
        assert!(fx.env.root().join("dev/pts").is_dir());
        assert!(fx.env.root().join("home").is_dir());

        // Idempotent
        builder.layout_skeleton()?;
        Ok(())
    }

    #[test]
    fn test_materialize_copies_transitive_closure() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        let tool = fx.host.join("bin/tool");
        let absent = fx.host.join("bin/absent");

        let report = builder.materialize(&[
            tool.to_string_lossy().into_owned(),
            absent.to_string_lossy().into_owned(),
        ])?;

        assert_eq!(report.binaries.len(), 1);
        assert_eq!(report.libraries.len(), 2);
        assert_eq!(report.missing, vec![absent.to_string_lossy().into_owned()]);
        assert_eq!(report.fresh_copies, 3);

        let copied_lib = mirror_path(fx.env.root(), &fx.host.join("lib/libb.so"));
        assert_eq!(fs::read_to_string(copied_lib).unwrap(), "libb");
        let copied_tool = mirror_path(fx.env.root(), &tool);
        assert_eq!(fs::metadata(copied_tool).unwrap().mode() & 0o777, 0o755);
        Ok(())
    }

    #[test]
    fn test_materialize_is_idempotent() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        let list = [fx.host.join("bin/tool").to_string_lossy().into_owned()];

        let first = builder.materialize(&list)?;
        let second = builder.materialize(&list)?;

        assert_eq!(first.copied(), second.copied());
        assert_eq!(second.fresh_copies, 0);
        Ok(())
    }

    #[test]
    fn test_materialize_keeps_installed_filter() -> Result<()> {
        let Some(ps) = locate_binary("ps") else {
            return Ok(());
        };
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        let list = [ps.to_string_lossy().into_owned()];

        builder.materialize(&list)?;
        let filter = ProcessFilter::new(&fx.env);
        assert!(filter.install()?);
        fs::remove_file(filter.backup()).unwrap();

        let report = builder.materialize(&list)?;
        assert_eq!(report.fresh_copies, 1);
        assert!(filter.is_installed());
        assert_eq!(fs::read(filter.backup()).unwrap(), fs::read(&ps).unwrap());
        Ok(())
    }

    #[test]
    fn test_single_level_mode_skips_indirect_libraries() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder =
            FilesystemBuilder::new(&fx.env, resolver).with_closure_mode(ClosureMode::SingleLevel);

        let report =
            builder.materialize(&[fx.host.join("bin/tool").to_string_lossy().into_owned()])?;
        assert_eq!(report.libraries.len(), 1);
        Ok(())
    }

    #[test]
    fn test_provision_baseline_config_resets_registry() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        builder.layout_skeleton()?;
        builder.provision_baseline_config()?;

        assert!(fx.env.is_initialized());
        let accounts = UserRegistry::new(&fx.env).list_accounts()?;
        assert_eq!(accounts.len(), 1);
        Ok(())
    }

    #[test]
    fn test_device_nodes_never_fatal() -> Result<()> {
        let (fx, resolver) = fixture();
        let builder = FilesystemBuilder::new(&fx.env, resolver);
        builder.layout_skeleton()?;

        let report = builder.provision_device_nodes()?;
        assert_eq!(
            report.created.len() + report.existing.len() + report.failed.len(),
            DEVICE_NODES.len()
        );

        // A second run finds whatever the first created
        let again = builder.provision_device_nodes()?;
        assert_eq!(again.existing.len(), report.created.len());
        Ok(())
    }

    #[test]
    fn test_locate_binary_by_name() {
        assert!(locate_binary("sh").is_some());
        assert!(locate_binary("/nonexistent/definitely-not-here").is_none());
    }

    #[test]
    fn test_same_binary_across_spellings() {
        let sh = locate_binary("sh").unwrap();
        assert!(same_binary("sh", sh.to_str().unwrap()));
        assert!(same_binary("not-installed-anywhere", "not-installed-anywhere"));
        assert!(!same_binary("not-installed-anywhere", "sh"));

        // Different binaries
        let ls = locate_binary("ls").unwrap();
        assert!(!same_binary("sh", ls.to_str().unwrap()));
    }

    #[test]
    fn test_device_table() {
        let console = DEVICE_NODES.iter().find(|n| n.name == "console").unwrap();
        assert_eq!((console.major, console.minor, console.mode), (5, 1, 0o600));
        assert!(
            DEVICE_NODES
                .iter()
                .filter(|n| n.name != "console")
                .all(|n| n.mode == 0o666)
        );
    }
}
