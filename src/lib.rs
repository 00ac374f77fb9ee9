//! secure-chroot - provision a chroot sandbox and enter it
//!
//! The library builds a self-contained filesystem root with its own account
//! tables and opens login shells inside it, trying full namespace isolation
//! first and falling back step by step to a bannered unrestricted shell.

// Public modules - exposed for the binary
pub mod builder;
pub mod capabilities;
pub mod cli;
pub mod commands;
pub mod config;
pub mod crypt;
pub mod deps;
pub mod environment;
pub mod error;
pub mod filter;
pub mod launcher;
pub mod mount_manager;
pub mod namespace;
pub mod registry;
pub mod session;
pub mod status;
pub mod systemd;

// Internal modules - only visible within the crate
pub(crate) mod bind_mount;
pub(crate) mod mount;
pub(crate) mod prompt;
pub(crate) mod utils;

pub use cli::Args;
pub use environment::ChrootEnvironment;
pub use error::{Error, Result};
pub use session::{SessionEngine, SessionReport};
