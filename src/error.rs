//! Error taxonomy
//!
//! Precondition failures abort the current command. Mount, device-node and
//! isolation failures are normally absorbed by their callers and only show up
//! as warnings or in a session's attempt trail, but they still have typed
//! variants so the absorbing code can say what it absorbed.

use std::path::PathBuf;
use thiserror::Error;

use crate::capabilities::HostCapability;
use crate::namespace::IsolationMethod;

#[derive(Debug, Error)]
pub enum Error {
    /// Not root, environment missing, insufficient disk space, unconfirmed
    /// destructive action, environment busy.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("account '{0}' already exists")]
    DuplicateAccount(String),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("invalid account name '{0}': expected [a-z_][a-z0-9_-]{{0,31}}")]
    InvalidAccountName(String),

    /// Credential tables that do not parse. Never patched silently.
    #[error("registry corrupt: {table} line {line}: {reason}")]
    RegistryCorrupt {
        table: &'static str,
        line: usize,
        reason: String,
    },

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("failed to mount {target}: {source}")]
    MountFailed {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("{method} unavailable: missing {missing:?}")]
    IsolationMethodUnavailable {
        method: IsolationMethod,
        missing: Vec<HostCapability>,
    },

    #[error("failed to create device node {node}: {source}")]
    DeviceNodeCreateFailed {
        node: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Launch(#[from] crate::launcher::LaunchError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailed(msg.into())
    }

    /// The errno behind a system-call failure, if there is one.
    pub fn errno(&self) -> Option<nix::errno::Errno> {
        match self {
            Error::MountFailed { source, .. } | Error::DeviceNodeCreateFailed { source, .. } => {
                Some(*source)
            }
            Error::Io { source, .. } => source.raw_os_error().map(nix::errno::Errno::from_raw),
            _ => None,
        }
    }

    pub(crate) fn corrupt(table: &'static str, line: usize, reason: impl Into<String>) -> Self {
        Error::RegistryCorrupt {
            table,
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach a human context to `io::Error`s, the way eyre's `wrap_err_with`
/// is used at the binary layer.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::Io {
            context: f().into(),
            source,
        })
    }
}

impl<T> IoContext<T> for std::result::Result<T, nix::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|errno| Error::Io {
            context: f().into(),
            source: std::io::Error::from(errno),
        })
    }
}
