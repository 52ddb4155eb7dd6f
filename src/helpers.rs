use std::env;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

/// Hash a file's contents. Returns `None` when the file cannot be read.
pub fn compute_file_hash(path: &Path) -> Option<blake3::Hash> {
    let bytes = std::fs::read(path).ok()?;
    Some(blake3::hash(&bytes))
}

/// Join paths into a single platform search-path value (`a:b:c` on unix).
pub fn join_search_path(paths: &[PathBuf]) -> io::Result<OsString> {
    env::join_paths(paths).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Split a platform search-path value back into paths.
pub fn split_search_path(value: &OsStr) -> Vec<PathBuf> {
    env::split_paths(value).collect()
}
