//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{DEFAULT_MIN_FREE_MB, DEFAULT_UNIT_DIR};
use crate::environment::DEFAULT_ROOT;
use crate::mount_manager::DEFAULT_TMP_SIZE;

#[derive(Parser, Debug)]
#[command(name = "secure-chroot")]
#[command(version)]
#[command(about = "Provision a chroot sandbox and enter it with best-effort isolation")]
#[command(
    long_about = "secure-chroot builds a self-contained filesystem root with its own \
                  accounts, copies in a set of host binaries with their shared libraries, \
                  and opens login shells inside it using the strongest isolation the host \
                  supports: PID/mount/UTS/IPC namespaces, a PID namespace only, or a plain \
                  chroot with a filtered process listing."
)]
pub struct Args {
    /// Root directory of the sandbox
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "SECURE_CHROOT_DIR",
        default_value = DEFAULT_ROOT
    )]
    pub root: PathBuf,

    /// Set logging level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Size cap of the tmpfs mounted on /tmp inside the sandbox
    #[arg(long, global = true, value_name = "SIZE", default_value = DEFAULT_TMP_SIZE, hide = true)]
    pub tmp_size: String,

    /// Where the auto-mount unit is installed
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_UNIT_DIR, hide = true)]
    pub unit_dir: PathBuf,

    /// Free space required before install, in MiB
    #[arg(long, global = true, value_name = "MB", default_value_t = DEFAULT_MIN_FREE_MB, hide = true)]
    pub min_free_mb: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build the sandbox and create its first account
    Install {
        /// Account to create (prompted for when omitted)
        #[arg(long, value_name = "NAME")]
        user: Option<String>,

        /// Password for the account (prompted for when omitted)
        #[arg(long, env = "SECURE_CHROOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Extra host binary to copy in (can be used multiple times)
        #[arg(long = "binary", value_name = "PATH")]
        binaries: Vec<String>,

        /// Copy only the direct library dependencies of each binary
        #[arg(long)]
        single_level: bool,
    },

    /// Open a login shell inside the sandbox
    Enter {
        username: String,

        /// Kill the session after this many seconds
        #[arg(long, value_name = "SECS")]
        session_timeout: Option<u64>,
    },

    /// Show the state of the sandbox and of the host's isolation support
    Status,

    /// Unmount everything and delete the sandbox
    Cleanup {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Re-create missing directories, binaries, device nodes and homes
    Repair,

    /// Rebuild the sandbox from scratch, keeping accounts and homes
    Rebuild {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Install or remove the filtered process listing permanently
    EnhanceIsolation {
        #[arg(value_enum)]
        action: FilterAction,
    },

    /// Create another account
    AddUser {
        username: String,

        /// Password for the account (prompted for when omitted)
        #[arg(long, env = "SECURE_CHROOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Reset the password of an account
    Passwd {
        username: String,

        /// New password (prompted for when omitted)
        #[arg(long, env = "SECURE_CHROOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Mount proc, sys, dev, devpts and tmp (used by the auto-mount unit)
    Mount,

    /// Reverse every sandbox mount (used by the auto-mount unit)
    Unmount,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Enhance,
    Remove,
}

impl Args {
    /// Validate the arguments
    pub fn validate(&self) -> eyre::Result<()> {
        if self.root.as_os_str().is_empty() || self.root == PathBuf::from("/") {
            eyre::bail!("--root must name a dedicated directory, not '{}'", self.root.display());
        }

        if !is_valid_size(&self.tmp_size) {
            eyre::bail!(
                "Invalid --tmp-size '{}'. Expected a number with an optional k, m, g or % suffix",
                self.tmp_size
            );
        }

        if let Command::Enter {
            session_timeout: Some(0),
            ..
        } = self.command
        {
            eyre::bail!("--session-timeout must be at least one second");
        }

        if let Command::Install { binaries, .. } = &self.command
            && binaries.iter().any(|b| b.trim().is_empty())
        {
            eyre::bail!("--binary requires a non-empty path or name");
        }

        // Validate log level
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            eyre::bail!(
                "Invalid log level '{}'. Valid levels are: error, warn, info, debug, trace",
                self.log_level
            );
        }

        Ok(())
    }
}

/// tmpfs `size=` syntax: digits, then at most one unit suffix.
fn is_valid_size(size: &str) -> bool {
    let digits = size.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G', '%']);
    !digits.is_empty()
        && size.len() - digits.len() <= 1
        && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("secure-chroot").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["status"]);
        assert_eq!(args.command, Command::Status);
        assert_eq!(args.log_level, "warn");
        assert_eq!(args.tmp_size, DEFAULT_TMP_SIZE);
        // SECURE_CHROOT_DIR may be set in the environment running the tests
        if std::env::var_os("SECURE_CHROOT_DIR").is_none() {
            assert_eq!(args.root, PathBuf::from(DEFAULT_ROOT));
        }
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_global_root_after_subcommand() {
        let args = parse(&["enter", "alice", "--root", "/srv/jail", "--session-timeout", "30"]);
        assert_eq!(args.root, PathBuf::from("/srv/jail"));
        assert_eq!(
            args.command,
            Command::Enter {
                username: "alice".to_string(),
                session_timeout: Some(30)
            }
        );
    }

    #[test]
    fn test_install_repeats_binary() {
        let args = parse(&[
            "install", "--user", "bob", "--binary", "htop", "--binary", "/usr/bin/vim",
        ]);
        match args.command {
            Command::Install { user, binaries, single_level, .. } => {
                assert_eq!(user.as_deref(), Some("bob"));
                assert_eq!(binaries, vec!["htop", "/usr/bin/vim"]);
                assert!(!single_level);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_enhance_isolation_actions() {
        let args = parse(&["enhance-isolation", "remove"]);
        assert_eq!(
            args.command,
            Command::EnhanceIsolation {
                action: FilterAction::Remove
            }
        );
        assert!(
            Args::try_parse_from(["secure-chroot", "enhance-isolation", "harden"]).is_err()
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--log-level", "loud", "status"]).validate().is_err());
        assert!(parse(&["--root", "/", "status"]).validate().is_err());
        assert!(parse(&["--tmp-size", "12XB", "status"]).validate().is_err());
        assert!(
            parse(&["enter", "alice", "--session-timeout", "0"])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_size_syntax() {
        assert!(is_valid_size("512M"));
        assert!(is_valid_size("1048576"));
        assert!(is_valid_size("50%"));
        assert!(!is_valid_size("M"));
        assert!(!is_valid_size("1MM"));
        assert!(!is_valid_size(""));
    }
}
