//! Isolation methods and namespace management

use nix::sched::{CloneFlags, unshare};
use std::fmt;

use crate::capabilities::HostCapability;

/// A strategy for entering the sandbox, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationMethod {
    /// New PID, mount, UTS and IPC namespaces with a private proc
    FullNamespace,
    /// New PID namespace with a private proc
    PidNamespace,
    /// chroot plus the cosmetic process filter
    BindChroot,
    /// Root shell in the chroot; the bannered last resort
    Unrestricted,
}

impl IsolationMethod {
    /// The methods tried in turn before falling back to [`IsolationMethod::Unrestricted`].
    pub const ORDERED: [IsolationMethod; 3] = [
        IsolationMethod::FullNamespace,
        IsolationMethod::PidNamespace,
        IsolationMethod::BindChroot,
    ];

    pub fn required_capabilities(&self) -> &'static [HostCapability] {
        match self {
            IsolationMethod::FullNamespace | IsolationMethod::PidNamespace => &[
                HostCapability::NamespaceUnshare,
                HostCapability::PrivilegeDrop,
            ],
            IsolationMethod::BindChroot => &[HostCapability::Chroot, HostCapability::PrivilegeDrop],
            IsolationMethod::Unrestricted => &[HostCapability::Chroot],
        }
    }

    pub fn clone_flags(&self) -> CloneFlags {
        match self {
            IsolationMethod::FullNamespace => {
                CloneFlags::CLONE_NEWPID
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWUTS
                    | CloneFlags::CLONE_NEWIPC
            }
            // The private proc needs its own mount namespace
            IsolationMethod::PidNamespace => CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS,
            IsolationMethod::BindChroot | IsolationMethod::Unrestricted => CloneFlags::empty(),
        }
    }

    pub fn private_proc(&self) -> bool {
        self.clone_flags().contains(CloneFlags::CLONE_NEWPID)
    }

    pub fn drops_privileges(&self) -> bool {
        !matches!(self, IsolationMethod::Unrestricted)
    }

    pub fn installs_filter(&self) -> bool {
        matches!(self, IsolationMethod::BindChroot)
    }
}

impl fmt::Display for IsolationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationMethod::FullNamespace => "full-namespace",
            IsolationMethod::PidNamespace => "pid-namespace",
            IsolationMethod::BindChroot => "bind-chroot",
            IsolationMethod::Unrestricted => "unrestricted",
        };
        f.pad(name)
    }
}

/// Unshare namespaces based on flags
pub(crate) fn unshare_namespaces(flags: CloneFlags) -> nix::Result<()> {
    log::debug!("Calling unshare() with flags: {:?}", flags);
    unshare(flags)?;
    log::debug!("unshare() syscall succeeded");
    Ok(())
}
