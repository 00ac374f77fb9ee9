//! Process launch for a single session attempt
//!
//! A [`LaunchPlan`] carries everything the child needs: the root, the
//! namespaces to unshare, the credentials to drop to and the shell to run.
//! The child reports setup failures through a close-on-exec pipe, so the
//! parent can tell "the shell never started" apart from "the shell ran and
//! exited non-zero". Only the former lets the caller try another method.

use std::convert::Infallible;
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, chdir, chroot, execve, fork, pipe2, setgid, setgroups, setuid};
use thiserror::Error;

use crate::mount::{make_private, mount_proc};
use crate::namespace::unshare_namespaces;

const SETUP_FAILED_EXIT: i32 = 127;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Account the session runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Host path of the sandbox root
    pub root: PathBuf,
    pub namespaces: CloneFlags,
    /// Mount a fresh proc inside the new PID namespace
    pub private_proc: bool,
    /// `None` keeps root
    pub credentials: Option<Credentials>,
    /// Directory to start in, inside the sandbox
    pub workdir: PathBuf,
    /// Login shell, inside the sandbox
    pub shell: PathBuf,
    /// The complete environment of the shell
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

impl LaunchOutcome {
    /// Shell-style exit code
    pub fn code(&self) -> i32 {
        match self {
            LaunchOutcome::Exited(code) => *code,
            LaunchOutcome::Signaled(sig) => 128 + sig,
            LaunchOutcome::TimedOut => 124,
        }
    }
}

impl fmt::Display for LaunchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchOutcome::Exited(code) => write!(f, "exited with status {}", code),
            LaunchOutcome::Signaled(sig) => write!(f, "killed by signal {}", sig),
            LaunchOutcome::TimedOut => write!(f, "killed after session timeout"),
        }
    }
}

/// Step of child setup that failed before the shell was exec'd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStage {
    Unshare = 1,
    MakePrivate,
    Fork,
    MountProc,
    Chroot,
    Chdir,
    SetGroups,
    SetGid,
    SetUid,
    DeathSignal,
    Exec,
}

impl SetupStage {
    const ALL: [SetupStage; 11] = [
        SetupStage::Unshare,
        SetupStage::MakePrivate,
        SetupStage::Fork,
        SetupStage::MountProc,
        SetupStage::Chroot,
        SetupStage::Chdir,
        SetupStage::SetGroups,
        SetupStage::SetGid,
        SetupStage::SetUid,
        SetupStage::DeathSignal,
        SetupStage::Exec,
    ];

    fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u8 == value)
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Unshare => "unshare",
            SetupStage::MakePrivate => "make / private",
            SetupStage::Fork => "fork namespace init",
            SetupStage::MountProc => "mount private proc",
            SetupStage::Chroot => "chroot",
            SetupStage::Chdir => "chdir",
            SetupStage::SetGroups => "setgroups",
            SetupStage::SetGid => "setgid",
            SetupStage::SetUid => "setuid",
            SetupStage::DeathSignal => "set parent death signal",
            SetupStage::Exec => "exec shell",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("session setup failed at {stage}: {errno}")]
    SetupFailed { stage: SetupStage, errno: Errno },

    #[error("failed to spawn session: {0}")]
    Spawn(#[source] Errno),

    #[error("failed to wait for session: {0}")]
    Wait(#[source] Errno),

    #[error("invalid launch plan: {0}")]
    InvalidPlan(String),
}

pub trait Launcher {
    fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, LaunchError>;
}

impl<T: Launcher + ?Sized> Launcher for &T {
    fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, LaunchError> {
        (**self).launch(plan)
    }
}

/// Launcher that forks, isolates and execs on this host
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkLauncher;

impl Launcher for ForkLauncher {
    fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, LaunchError> {
        let exec = ExecArgs::new(plan)?;
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Spawn)?;

        // The shell owns the terminal; ^C must not take the supervisor down
        let _interrupts = IgnoreInterrupts::install().map_err(LaunchError::Spawn)?;

        log::debug!("Launching {} in {}", plan.shell.display(), plan.root.display());
        match unsafe { fork() }.map_err(LaunchError::Spawn)? {
            ForkResult::Child => {
                drop(reader);
                run_child(plan, &exec, File::from(writer))
            }
            ForkResult::Parent { child } => {
                drop(writer);
                if let Some((stage, errno)) = read_status(File::from(reader)) {
                    let _ = wait_for(child, None);
                    return Err(LaunchError::SetupFailed { stage, errno });
                }
                log::debug!("Session process {} started", child);
                wait_for(child, plan.timeout)
            }
        }
    }
}

/// Arguments for execve, built before forking
struct ExecArgs {
    shell: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
}

impl ExecArgs {
    fn new(plan: &LaunchPlan) -> Result<Self, LaunchError> {
        let invalid = |what: &str| LaunchError::InvalidPlan(format!("{} contains a NUL byte", what));

        let shell = CString::new(plan.shell.as_os_str().as_bytes()).map_err(|_| invalid("shell"))?;
        let argv = vec![shell.clone(), CString::new("-l").map_err(|_| invalid("argv"))?];
        let env = plan
            .env
            .iter()
            .map(|(k, v)| CString::new(format!("{}={}", k, v)).map_err(|_| invalid(k.as_str())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { shell, argv, env })
    }
}

type Failure = (SetupStage, Errno);

fn at(stage: SetupStage) -> impl FnOnce(Errno) -> Failure {
    move |errno| (stage, errno)
}

/// Child side of the fork. Never returns.
fn run_child(plan: &LaunchPlan, exec: &ExecArgs, status: File) -> ! {
    if let Err(failure) = set_pdeathsig(libc::SIGKILL).map_err(at(SetupStage::DeathSignal)) {
        report_and_exit(status, failure);
    }

    if !plan.namespaces.is_empty() {
        if let Err(failure) = enter_namespaces(plan.namespaces) {
            report_and_exit(status, failure);
        }

        // The first process forked after unsharing a PID namespace becomes its
        // init; this one stays behind to relay the exit status
        if plan.namespaces.contains(CloneFlags::CLONE_NEWPID) {
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    drop(status);
                    relay_exit(child)
                }
                Ok(ForkResult::Child) => {}
                Err(errno) => report_and_exit(status, (SetupStage::Fork, errno)),
            }
        }
    }

    let failure = match finish_and_exec(plan, exec) {
        Ok(never) => match never {},
        Err(failure) => failure,
    };
    report_and_exit(status, failure)
}

fn enter_namespaces(flags: CloneFlags) -> Result<(), Failure> {
    unshare_namespaces(flags).map_err(at(SetupStage::Unshare))?;
    if flags.contains(CloneFlags::CLONE_NEWNS) {
        make_private("/").map_err(|e| (SetupStage::MakePrivate, e.errno().unwrap_or(Errno::EIO)))?;
    }
    Ok(())
}

fn finish_and_exec(plan: &LaunchPlan, exec: &ExecArgs) -> Result<Infallible, Failure> {
    if plan.private_proc {
        mount_proc(plan.root.join("proc"))
            .map_err(|e| (SetupStage::MountProc, e.errno().unwrap_or(Errno::EIO)))?;
    }

    chroot(&plan.root).map_err(at(SetupStage::Chroot))?;
    chdir("/").map_err(at(SetupStage::Chdir))?;

    if let Some(creds) = plan.credentials {
        // Group first: after setuid there is no privilege left to change it
        setgroups(&[]).map_err(at(SetupStage::SetGroups))?;
        setgid(Gid::from_raw(creds.gid)).map_err(at(SetupStage::SetGid))?;
        setuid(Uid::from_raw(creds.uid)).map_err(at(SetupStage::SetUid))?;
        // The credential change cleared the death signal
        set_pdeathsig(libc::SIGKILL).map_err(at(SetupStage::DeathSignal))?;
    }

    if chdir(&plan.workdir).is_err() {
        let _ = chdir("/");
    }

    restore_default_signals();
    execve(&exec.shell, &exec.argv, &exec.env).map_err(at(SetupStage::Exec))
}

fn report_and_exit(mut status: File, (stage, errno): Failure) -> ! {
    let _ = status.write_all(&encode_status(stage, errno));
    drop(status);
    // Skip atexit handlers and stdio flushing inherited from the parent
    unsafe { libc::_exit(SETUP_FAILED_EXIT) }
}

/// Wait for the namespace init and exit with its status.
fn relay_exit(child: Pid) -> ! {
    let code = match wait_for(child, None) {
        Ok(outcome) => outcome.code(),
        Err(_) => 1,
    };
    unsafe { libc::_exit(code) }
}

fn encode_status(stage: SetupStage, errno: Errno) -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = stage as u8;
    buf[1..].copy_from_slice(&(errno as i32).to_le_bytes());
    buf
}

fn decode_status(buf: &[u8]) -> Option<Failure> {
    let stage = SetupStage::from_u8(*buf.first()?)?;
    let raw: [u8; 4] = buf.get(1..5)?.try_into().ok()?;
    Some((stage, Errno::from_raw(i32::from_le_bytes(raw))))
}

/// Empty read: the pipe closed on exec, so the shell is running.
fn read_status(mut reader: File) -> Option<Failure> {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf) {
        log::warn!("Could not read session status pipe: {}", err);
        return None;
    }
    decode_status(&buf)
}

fn wait_for(child: Pid, timeout: Option<Duration>) -> Result<LaunchOutcome, LaunchError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let flags = deadline.map(|_| WaitPidFlag::WNOHANG);

    loop {
        match waitpid(child, flags) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(LaunchOutcome::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(LaunchOutcome::Signaled(sig as i32)),
            Ok(WaitStatus::StillAlive) => {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    log::warn!("Session {} exceeded its timeout, killing it", child);
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Ok(LaunchOutcome::TimedOut);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(errno) => return Err(LaunchError::Wait(errno)),
        }
    }
}

/// Ignores SIGINT and SIGQUIT until dropped.
struct IgnoreInterrupts {
    saved: Vec<(Signal, SigAction)>,
}

const INTERRUPTS: [Signal; 2] = [Signal::SIGINT, Signal::SIGQUIT];

impl IgnoreInterrupts {
    fn install() -> nix::Result<Self> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let mut saved = Vec::with_capacity(INTERRUPTS.len());
        for sig in INTERRUPTS {
            let previous = unsafe { sigaction(sig, &ignore) }?;
            saved.push((sig, previous));
        }
        Ok(Self { saved })
    }
}

impl Drop for IgnoreInterrupts {
    fn drop(&mut self) {
        for (sig, previous) in &self.saved {
            let _ = unsafe { sigaction(*sig, previous) };
        }
    }
}

/// Ignored dispositions survive exec, so the shell gets the defaults back.
fn restore_default_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in INTERRUPTS {
        let _ = unsafe { sigaction(sig, &default) };
    }
}

/// Set parent death signal (safer wrapper around prctl)
fn set_pdeathsig(sig: libc::c_int) -> nix::Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, sig, 0, 0, 0) };
    Errno::result(ret).map(drop)
}

/// The environment a session shell receives; nothing else is inherited.
pub fn shell_environment(home: &Path, user: &str, shell: &Path) -> Vec<(String, String)> {
    let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());
    vec![
        (
            "PATH".to_string(),
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        ),
        ("HOME".to_string(), home.display().to_string()),
        ("USER".to_string(), user.to_string()),
        ("LOGNAME".to_string(), user.to_string()),
        ("SHELL".to_string(), shell.display().to_string()),
        ("TERM".to_string(), term),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan(root: &Path) -> LaunchPlan {
        LaunchPlan {
            root: root.to_path_buf(),
            namespaces: CloneFlags::empty(),
            private_proc: false,
            credentials: None,
            workdir: PathBuf::from("/"),
            shell: PathBuf::from("/bin/sh"),
            env: shell_environment(Path::new("/root"), "root", Path::new("/bin/sh")),
            timeout: None,
        }
    }

    #[test]
    fn test_status_encoding() {
        let buf = encode_status(SetupStage::SetUid, Errno::EPERM);
        assert_eq!(decode_status(&buf), Some((SetupStage::SetUid, Errno::EPERM)));
        assert_eq!(decode_status(&[]), None);
        assert_eq!(decode_status(&[0, 1, 0, 0, 0]), None);
        assert_eq!(decode_status(&buf[..3]), None);
    }

    #[test]
    fn test_environment_contract() {
        let env = shell_environment(Path::new("/home/alice"), "alice", Path::new("/bin/bash"));
        let keys: Vec<_> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["PATH", "HOME", "USER", "LOGNAME", "SHELL", "TERM"]);
        assert_eq!(env[1].1, "/home/alice");
        assert!(env[0].1.starts_with("/usr/local/sbin:"));
    }

    #[test]
    fn test_plan_with_nul_is_rejected() {
        let mut bad = plan(Path::new("/tmp"));
        bad.env.push(("BAD".to_string(), "a\0b".to_string()));
        assert!(matches!(
            ForkLauncher.launch(&bad),
            Err(LaunchError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_setup_failure_is_reported_not_exited() {
        // Unprivileged: chroot fails. Privileged: the empty root has no shell.
        let tmp = TempDir::new().unwrap();
        let result = ForkLauncher.launch(&plan(tmp.path()));

        match result {
            Err(LaunchError::SetupFailed { stage, .. }) => {
                assert!(matches!(stage, SetupStage::Chroot | SetupStage::Exec));
            }
            other => panic!("expected a setup failure, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        let outcome = wait_for(pid, Some(Duration::from_millis(200))).unwrap();
        assert_eq!(outcome, LaunchOutcome::TimedOut);
        assert_eq!(outcome.code(), 124);
    }

    #[test]
    fn test_exit_status_passthrough() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        assert_eq!(wait_for(pid, None).unwrap(), LaunchOutcome::Exited(3));
    }
}
