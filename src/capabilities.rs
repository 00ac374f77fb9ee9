//! Host capability probing

use caps::{CapSet, Capability};
use std::fmt;
use std::path::Path;

/// Something the host must offer before an operation is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostCapability {
    /// unshare(2) of PID, mount, UTS and IPC namespaces
    NamespaceUnshare,
    /// setgroups/setgid/setuid to an unprivileged account
    PrivilegeDrop,
    /// chroot(2); mandatory for every session
    Chroot,
    /// mount(2)
    Mount,
    /// `ldd` for library closures
    DependencyResolver,
    /// `debootstrap`, informational only
    Bootstrap,
}

impl HostCapability {
    pub const ALL: [HostCapability; 6] = [
        HostCapability::NamespaceUnshare,
        HostCapability::PrivilegeDrop,
        HostCapability::Chroot,
        HostCapability::Mount,
        HostCapability::DependencyResolver,
        HostCapability::Bootstrap,
    ];
}

impl fmt::Display for HostCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostCapability::NamespaceUnshare => "namespace-unshare",
            HostCapability::PrivilegeDrop => "privilege-drop",
            HostCapability::Chroot => "chroot",
            HostCapability::Mount => "mount",
            HostCapability::DependencyResolver => "dependency-resolver",
            HostCapability::Bootstrap => "bootstrap",
        };
        f.pad(name)
    }
}

pub trait HostProbe {
    fn has(&self, capability: HostCapability) -> bool;

    /// The subset of `required` this host lacks.
    fn missing(&self, required: &[HostCapability]) -> Vec<HostCapability> {
        required.iter().copied().filter(|c| !self.has(*c)).collect()
    }
}

impl<T: HostProbe + ?Sized> HostProbe for &T {
    fn has(&self, capability: HostCapability) -> bool {
        (**self).has(capability)
    }
}

/// Probe backed by the effective capability set and `PATH`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

const NAMESPACE_FILES: &[&str] = &["pid", "mnt", "uts", "ipc"];

impl HostProbe for SystemProbe {
    fn has(&self, capability: HostCapability) -> bool {
        let found = match capability {
            HostCapability::NamespaceUnshare => {
                effective(Capability::CAP_SYS_ADMIN)
                    && NAMESPACE_FILES
                        .iter()
                        .all(|ns| Path::new("/proc/self/ns").join(ns).exists())
            }
            HostCapability::PrivilegeDrop => {
                effective(Capability::CAP_SETUID) && effective(Capability::CAP_SETGID)
            }
            HostCapability::Chroot => effective(Capability::CAP_SYS_CHROOT),
            HostCapability::Mount => effective(Capability::CAP_SYS_ADMIN),
            HostCapability::DependencyResolver => which::which("ldd").is_ok(),
            HostCapability::Bootstrap => which::which("debootstrap").is_ok(),
        };
        log::trace!("Host capability {}: {}", capability, found);
        found
    }
}

fn effective(cap: Capability) -> bool {
    match caps::has_cap(None, CapSet::Effective, cap) {
        Ok(present) => present,
        Err(err) => {
            log::debug!("Could not read capability {:?}: {}", cap, err);
            false
        }
    }
}
