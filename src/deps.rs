//! Shared-library dependency resolution
//!
//! The host's dynamic linker is the authority on what a binary loads, so the
//! default resolver asks it through `ldd` rather than parsing ELF headers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{IoContext, Result};

/// Direct dependencies of one object, as reported by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub resolved: Vec<PathBuf>,
    /// Sonames the resolver could not locate on the host
    pub unresolved: Vec<String>,
}

pub trait DependencyResolver {
    fn dependencies(&self, object: &Path) -> Result<Dependencies>;
}

/// Resolver backed by the host's `ldd`
#[derive(Debug, Clone)]
pub struct LddResolver {
    program: PathBuf,
}

impl LddResolver {
    pub fn new() -> Self {
        let program = which::which("ldd").unwrap_or_else(|_| PathBuf::from("ldd"));
        Self { program }
    }

    pub fn available() -> bool {
        which::which("ldd").is_ok()
    }
}

impl Default for LddResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver for LddResolver {
    fn dependencies(&self, object: &Path) -> Result<Dependencies> {
        let output = Command::new(&self.program)
            .arg(object)
            .env("LC_ALL", "C")
            .output()
            .io_context(|| format!("running {} {}", self.program.display(), object.display()))?;

        // ldd exits non-zero for static binaries and scripts; both simply have
        // no dependencies
        if !output.status.success() {
            log::debug!(
                "{} reported no dynamic dependencies ({})",
                object.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Dependencies::default());
        }

        Ok(parse_ldd_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse the text `ldd` prints for one object.
pub fn parse_ldd_output(output: &str) -> Dependencies {
    let mut deps = Dependencies::default();

    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.contains("statically linked") || line.contains("not a dynamic") {
            continue;
        }

        if let Some((soname, target)) = line.split_once("=>") {
            let target = target.trim();
            if target.starts_with("not found") {
                deps.unresolved.push(soname.trim().to_string());
                continue;
            }
            if let Some(path) = leading_path(target) {
                deps.resolved.push(path);
            }
            // "linux-vdso.so.1 =>  (0x...)" on older glibc has no path
        } else if let Some(path) = leading_path(line) {
            // The interpreter line: "/lib64/ld-linux-x86-64.so.2 (0x...)"
            deps.resolved.push(path);
        }
    }

    deps
}

fn leading_path(text: &str) -> Option<PathBuf> {
    let candidate = text.split_whitespace().next()?;
    candidate.starts_with('/').then(|| PathBuf::from(candidate))
}

/// How far to follow library dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosureMode {
    /// Follow every library's own dependencies until nothing new appears
    #[default]
    Transitive,
    /// Only the binary's direct dependencies (legacy behaviour)
    SingleLevel,
}

/// The library closure of a set of binaries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closure {
    pub libraries: BTreeSet<PathBuf>,
    pub unresolved: BTreeSet<String>,
}

/// Compute the library closure of `binaries`, level by level.
pub fn library_closure<R: DependencyResolver + ?Sized>(
    resolver: &R,
    binaries: &[PathBuf],
    mode: ClosureMode,
) -> Result<Closure> {
    let mut closure = Closure::default();
    let mut pending: Vec<PathBuf> = binaries.to_vec();

    while !pending.is_empty() {
        let mut next = Vec::new();
        for object in pending.drain(..) {
            let deps = resolver.dependencies(&object)?;
            for soname in deps.unresolved {
                log::warn!("{}: library {} not found on host", object.display(), soname);
                closure.unresolved.insert(soname);
            }
            for lib in deps.resolved {
                if closure.libraries.insert(lib.clone()) {
                    log::trace!("{} needs {}", object.display(), lib.display());
                    next.push(lib);
                }
            }
        }
        if mode == ClosureMode::SingleLevel {
            break;
        }
        pending = next;
    }

    Ok(closure)
}
