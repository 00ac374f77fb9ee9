//! Session entry: the isolation fallback chain
//!
//! ```text
//! MOUNTED -> TRY(method[i]) -> SUCCESS -> CLEANUP
//!                           -> FAILURE -> TRY(method[i+1])
//!         -> (exhausted)    -> unrestricted shell with banner -> CLEANUP
//! ```
//!
//! Mounts are taken once before the first attempt and released once after
//! the last, by a guard, whichever way the sequence ends.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capabilities::{HostCapability, HostProbe};
use crate::environment::ChrootEnvironment;
use crate::error::{Error, Result};
use crate::filter::ProcessFilter;
use crate::launcher::{Credentials, LaunchOutcome, LaunchPlan, Launcher, shell_environment};
use crate::mount_manager::{MountManager, MountReport, Mounter};
use crate::namespace::IsolationMethod;
use crate::registry::{UserRecord, UserRegistry};

const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];

#[derive(Debug)]
pub enum AttemptOutcome {
    /// Never launched; the host lacks these capabilities
    Unavailable(Vec<HostCapability>),
    /// Launched but setup failed before the shell started
    Failed(String),
    Succeeded(LaunchOutcome),
}

#[derive(Debug)]
pub struct Attempt {
    pub method: IsolationMethod,
    pub outcome: AttemptOutcome,
}

/// What happened during one `enter`
#[derive(Debug)]
pub struct SessionReport {
    pub username: String,
    /// The method that actually ran the shell
    pub method: IsolationMethod,
    pub attempts: Vec<Attempt>,
    pub outcome: LaunchOutcome,
    pub mounts: MountReport,
    /// Whether every unmount after the session succeeded
    pub unmounted_cleanly: bool,
    /// Why the unrestricted fallback ran, if it did
    pub fallback_reason: Option<String>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session for {} ran with {} ({})",
            self.username, self.method, self.outcome
        )?;
        writeln!(f, "Attempts:")?;
        for attempt in &self.attempts {
            write!(f, "  {:<15} ", attempt.method)?;
            match &attempt.outcome {
                AttemptOutcome::Unavailable(missing) => {
                    let names: Vec<String> = missing.iter().map(|c| c.to_string()).collect();
                    writeln!(f, "unavailable (missing {})", names.join(", "))?
                }
                AttemptOutcome::Failed(reason) => writeln!(f, "failed: {}", reason)?,
                AttemptOutcome::Succeeded(outcome) => writeln!(f, "ran, {}", outcome)?,
            }
        }
        if let Some(reason) = &self.fallback_reason {
            writeln!(f, "Fallback reason: {}", reason)?;
        }
        if self.mounts.failures() > 0 {
            writeln!(f, "Mounts:")?;
            write!(f, "{}", self.mounts)?;
        }
        if !self.unmounted_cleanly {
            writeln!(f, "Warning: some mounts could not be released; run `unmount`")?;
        }
        Ok(())
    }
}

pub struct SessionEngine<'a, P: HostProbe, L: Launcher, M: Mounter> {
    env: &'a ChrootEnvironment,
    probe: P,
    launcher: L,
    mounts: MountManager<M>,
    timeout: Option<Duration>,
}

impl<'a, P: HostProbe, L: Launcher, M: Mounter> SessionEngine<'a, P, L, M> {
    pub fn new(env: &'a ChrootEnvironment, probe: P, launcher: L, mounter: M) -> Self {
        Self {
            env,
            probe,
            launcher,
            mounts: MountManager::new(env, mounter),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tmp_size(mut self, size: impl Into<String>) -> Self {
        self.mounts = self.mounts.with_tmp_size(size);
        self
    }

    pub fn enter(&self, username: &str) -> Result<SessionReport> {
        if !self.env.exists() {
            return Err(Error::precondition(format!(
                "environment {} does not exist; run install first",
                self.env.root().display()
            )));
        }
        let account = UserRegistry::new(self.env).find(username)?;
        if !self.probe.has(HostCapability::Chroot) {
            return Err(Error::precondition(
                "entering the sandbox needs the chroot capability (CAP_SYS_CHROOT)",
            ));
        }
        let shell = self.resolve_shell(&account.shell)?;

        let mounts = self.mounts.mount_all();
        if mounts.failures() > 0 {
            log::warn!(
                "{} of {} mounts failed; continuing with a degraded sandbox",
                mounts.failures(),
                mounts.outcomes.len()
            );
        }
        let guard = self.mounts.guard();

        let mut attempts = Vec::new();
        for method in IsolationMethod::ORDERED {
            let missing = self.probe.missing(method.required_capabilities());
            if !missing.is_empty() {
                log::info!("Skipping {}: {}", method, unavailable(method, &missing));
                attempts.push(Attempt {
                    method,
                    outcome: AttemptOutcome::Unavailable(missing),
                });
                continue;
            }

            log::info!("Entering as {} with {}", username, method);
            match self.attempt(method, &account, &shell) {
                Ok(outcome) => {
                    attempts.push(Attempt {
                        method,
                        outcome: AttemptOutcome::Succeeded(outcome),
                    });
                    let unmounted = guard.release();
                    return Ok(SessionReport {
                        username: username.to_string(),
                        method,
                        attempts,
                        outcome,
                        mounts,
                        unmounted_cleanly: unmounted.is_clean(),
                        fallback_reason: None,
                    });
                }
                Err(err) => {
                    log::warn!("{} failed: {}", method, err);
                    attempts.push(Attempt {
                        method,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                    });
                }
            }
        }

        let reason = if self.probe.has(HostCapability::PrivilegeDrop) {
            "every isolation method failed to start".to_string()
        } else {
            "this host cannot drop privileges (CAP_SETUID/CAP_SETGID missing)".to_string()
        };
        eprint!("{}", banner(&reason));

        let method = IsolationMethod::Unrestricted;
        let outcome = self.attempt(method, &account, &shell)?;
        attempts.push(Attempt {
            method,
            outcome: AttemptOutcome::Succeeded(outcome),
        });
        let unmounted = guard.release();

        Ok(SessionReport {
            username: username.to_string(),
            method,
            attempts,
            outcome,
            mounts,
            unmounted_cleanly: unmounted.is_clean(),
            fallback_reason: Some(reason),
        })
    }

    fn attempt(
        &self,
        method: IsolationMethod,
        account: &UserRecord,
        shell: &Path,
    ) -> Result<LaunchOutcome> {
        let _filter = if method.installs_filter() {
            Some(ProcessFilter::new(self.env).scoped()?)
        } else {
            None
        };
        let plan = self.plan(method, account, shell);
        Ok(self.launcher.launch(&plan)?)
    }

    /// A fresh plan per attempt; nothing is written to disk for it.
    fn plan(&self, method: IsolationMethod, account: &UserRecord, shell: &Path) -> LaunchPlan {
        let (credentials, home, user) = if method.drops_privileges() {
            (
                Some(Credentials {
                    uid: account.uid,
                    gid: account.gid,
                }),
                account.home.clone(),
                account.username.as_str(),
            )
        } else {
            (None, PathBuf::from("/root"), "root")
        };

        LaunchPlan {
            root: self.env.root().to_path_buf(),
            namespaces: method.clone_flags(),
            private_proc: method.private_proc(),
            credentials,
            env: shell_environment(&home, user, shell),
            workdir: home,
            shell: shell.to_path_buf(),
            timeout: self.timeout,
        }
    }

    /// The account's shell if the sandbox has it, else the first fallback that exists.
    fn resolve_shell(&self, preferred: &Path) -> Result<PathBuf> {
        std::iter::once(preferred)
            .chain(FALLBACK_SHELLS.iter().map(Path::new))
            .find(|shell| self.env.inside(shell).is_file())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::precondition(format!(
                    "no usable shell in {} (tried {} and {})",
                    self.env.root().display(),
                    preferred.display(),
                    FALLBACK_SHELLS.join(", ")
                ))
            })
    }
}

fn unavailable(method: IsolationMethod, missing: &[HostCapability]) -> Error {
    Error::IsolationMethodUnavailable {
        method,
        missing: missing.to_vec(),
    }
}

fn banner(reason: &str) -> String {
    format!(
        "\n\
         ************************************************************\n\
         * WARNING: UNRESTRICTED SESSION                            *\n\
         ************************************************************\n\
         Entering the sandbox as root with no isolation.\n\
         Reason: {}.\n\
         Processes inside can see and signal every process on the host.\n\n",
        reason
    )
}
