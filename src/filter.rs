//! Cosmetic process-listing filter
//!
//! Replaces the sandbox's `ps` with a shell shim that narrows full listings
//! to the calling account. It hides nothing from anyone who reads `/proc`
//! directly, and the shim says so in its own header.

use std::fs;
use std::path::{Path, PathBuf};

use crate::environment::ChrootEnvironment;
use crate::error::{IoContext, Result};
use crate::utils::write_atomic;

/// Identifies an installed shim so its backup is never overwritten.
pub const MARKER: &str = "# secure-chroot process filter";

const CANDIDATES: &[&str] = &["bin/ps", "usr/bin/ps"];
const BACKUP_NAME: &str = "ps.real";

const SHIM: &str = r##"#!/bin/sh
# secure-chroot process filter
# Cosmetic only: full listings are narrowed to the calling account.
# This is not a security boundary; /proc stays readable.
REAL="@REAL@"
ME=$(id -un 2>/dev/null || echo "${USER:-unknown}")

case "$*" in
    "") set -- -f ;;
    aux|-e|-ef|-A|ax|-aux|-eF|-ely) ;;
    *) exec "$REAL" "$@" ;;
esac

OUT=""
if [ -x "$REAL" ]; then
    OUT=$("$REAL" "$@" 2>/dev/null)
fi
ROWS=$(printf '%s\n' "$OUT" | tail -n +2 | grep -w -- "$ME")

if [ -n "$ROWS" ]; then
    printf '%s\n' "$OUT" | head -n 1
    printf '%s\n' "$ROWS"
else
    echo "  PID TTY          TIME CMD"
    printf '%5s %-12s %8s %s\n' "$PPID" "?" "00:00:00" "${SHELL##*/}"
fi
"##;

/// Render the shim for a real `ps` at `real` (a path inside the sandbox).
pub fn render_shim(real: &str) -> String {
    SHIM.replace("@REAL@", real)
}

#[derive(Debug, Clone)]
pub struct ProcessFilter {
    root: PathBuf,
}

impl ProcessFilter {
    pub fn new(env: &ChrootEnvironment) -> Self {
        Self {
            root: env.root().to_path_buf(),
        }
    }

    /// Host path of the `ps` being replaced: the first candidate that
    /// exists, `bin/ps` otherwise.
    pub fn target(&self) -> PathBuf {
        CANDIDATES
            .iter()
            .map(|c| self.root.join(c))
            .find(|p| p.exists())
            .unwrap_or_else(|| self.root.join(CANDIDATES[0]))
    }

    pub fn backup(&self) -> PathBuf {
        self.target().with_file_name(BACKUP_NAME)
    }

    pub fn is_installed(&self) -> bool {
        fs::read_to_string(self.target())
            .map(|content| content.lines().any(|l| l == MARKER))
            .unwrap_or(false)
    }

    /// Install the shim. Returns `false` when it was already in place.
    pub fn install(&self) -> Result<bool> {
        if self.is_installed() {
            log::debug!("Process filter already installed at {}", self.target().display());
            return Ok(false);
        }

        let target = self.target();
        let backup = self.backup();
        if target.exists() {
            fs::rename(&target, &backup)
                .io_context(|| format!("moving {} to {}", target.display(), backup.display()))?;
        } else if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }

        let inside = Path::new("/").join(backup.strip_prefix(&self.root).unwrap_or(&backup));
        write_atomic(&target, render_shim(&inside.to_string_lossy()).as_bytes(), 0o755)?;

        log::info!("Installed process filter at {}", target.display());
        Ok(true)
    }

    /// Restore the original `ps`. Returns `false` when no shim was installed.
    pub fn remove(&self) -> Result<bool> {
        if !self.is_installed() {
            return Ok(false);
        }

        let target = self.target();
        let backup = self.backup();
        if backup.exists() {
            fs::rename(&backup, &target)
                .io_context(|| format!("restoring {}", target.display()))?;
        } else {
            fs::remove_file(&target).io_context(|| format!("removing {}", target.display()))?;
        }

        log::info!("Removed process filter from {}", target.display());
        Ok(true)
    }

    /// Install for the lifetime of the returned guard. Only a shim this call
    /// installed is removed again.
    pub fn scoped(&self) -> Result<FilterGuard> {
        let installed_here = self.install()?;
        Ok(FilterGuard {
            filter: self.clone(),
            installed_here,
        })
    }
}

pub struct FilterGuard {
    filter: ProcessFilter,
    installed_here: bool,
}

impl FilterGuard {
    pub fn installed_here(&self) -> bool {
        self.installed_here
    }
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if self.installed_here
            && let Err(err) = self.filter.remove()
        {
            log::warn!("Failed to restore ps after session: {}", err);
        }
    }
}
