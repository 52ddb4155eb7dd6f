//! Library-name resolution boundary for isolated compiler environments.
//!
//! The compiler runs against its own copy of every library it needs, even
//! when the calling process already has a different version of the same
//! library on its ambient search path. The boundary decides, per requested
//! library name, whether the name is satisfied from the privileged set (the
//! compiler classpath) or deferred to the ambient environment.
//!
//! A small set of bridge libraries is always deferred to the ambient
//! environment regardless of policy: they carry the identity and request
//! value types exchanged with worker processes, and both sides of the
//! boundary must agree on a single definition.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Library-name prefixes that are never intercepted by the privileged set.
pub const BRIDGE_PREFIXES: &[&str] = &["scriptpack-proto"];

/// Interception policy, matched against requested library names by prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", content = "prefixes", rename_all = "camelCase")]
pub enum BoundaryPolicy {
    /// Only names matching one of the prefixes are privileged; a privileged
    /// miss falls back to the ambient environment.
    AllowList(Vec<String>),
    /// Every name is privileged except those matching one of the prefixes;
    /// a privileged miss does not fall back.
    DenyList(Vec<String>),
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        BoundaryPolicy::DenyList(Vec::new())
    }
}

/// A resolution scope over a privileged and an ambient set of library files.
///
/// Lookups take `&self` only; a boundary is shared across concurrent
/// workers.
#[derive(Debug)]
pub struct ResolutionBoundary {
    privileged: Vec<PathBuf>,
    ambient: Vec<PathBuf>,
    policy: BoundaryPolicy,
}

impl ResolutionBoundary {
    pub fn new(privileged: Vec<PathBuf>, ambient: Vec<PathBuf>, policy: BoundaryPolicy) -> Self {
        let mut privileged = privileged;
        let mut ambient = ambient;
        // Deterministic lookup order regardless of manifest order.
        privileged.sort();
        ambient.sort();
        Self {
            privileged,
            ambient,
            policy,
        }
    }

    /// Resolve a library name to a concrete file. Misses produce the same
    /// error shape as any missing module.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if is_bridge(name) {
            return lookup(&self.ambient, name).ok_or_else(|| not_found(name));
        }
        match &self.policy {
            BoundaryPolicy::AllowList(prefixes) => {
                if matches_any(name, prefixes) {
                    // Privileged first, ambient as fallback.
                    lookup(&self.privileged, name)
                        .or_else(|| lookup(&self.ambient, name))
                        .ok_or_else(|| not_found(name))
                } else {
                    lookup(&self.ambient, name).ok_or_else(|| not_found(name))
                }
            }
            BoundaryPolicy::DenyList(prefixes) => {
                if matches_any(name, prefixes) {
                    lookup(&self.ambient, name).ok_or_else(|| not_found(name))
                } else {
                    // No fallback: a denied-list boundary either satisfies a
                    // privileged name itself or fails the lookup.
                    lookup(&self.privileged, name).ok_or_else(|| not_found(name))
                }
            }
        }
    }

    /// Resolve every privileged library name through the policy and return
    /// the resulting search path for a compiler environment. Names the
    /// policy defers on that have no ambient copy are skipped.
    pub fn compose_search_path(&self) -> Vec<PathBuf> {
        let mut names: Vec<String> = self
            .privileged
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        names.dedup();

        let mut out: Vec<PathBuf> = Vec::with_capacity(names.len());
        for name in &names {
            match self.resolve(name) {
                Ok(path) => {
                    if !out.contains(&path) {
                        out.push(path);
                    }
                }
                Err(_) => {
                    log::debug!("boundary: no resolution for library `{name}`, skipping");
                }
            }
        }
        out
    }
}

fn is_bridge(name: &str) -> bool {
    BRIDGE_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn matches_any(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// A file satisfies `name` when its stem is the name itself or a versioned
/// form of it (`name-1.2.3.lib`).
fn file_matches(path: &Path, name: &str) -> bool {
    match path.file_stem() {
        Some(stem) => {
            let stem = stem.to_string_lossy();
            stem == name || stem.starts_with(&format!("{name}-"))
        }
        None => false,
    }
}

fn lookup(paths: &[PathBuf], name: &str) -> Option<PathBuf> {
    paths.iter().find(|p| file_matches(p, name)).cloned()
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("library `{name}` not found"))
}
