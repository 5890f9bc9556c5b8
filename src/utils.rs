//! Utility functions

use crate::error::{BuildError, IoError, Result};
use md5::{Digest, Md5};
use path_slash::PathExt;
use serde::de::DeserializeOwned;
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

/// Compute the hex-encoded 128-bit digest of `text`.
///
/// Content digests are compared across runs, so the digest function must stay
/// stable for the lifetime of a cache format version.
pub fn compute_hash(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

/// Returns the same path config but with canonicalized paths.
///
/// This uses [`dunce`] to ensure windows paths stay free of UNC prefixes.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, IoError> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| IoError::new(err, path))
}

/// Lexically absolutize `path` against the current working directory, without
/// touching the file system. Windows verbatim prefixes are stripped so paths
/// stay comparable to what the compiler-facing tools print.
pub fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    dunce::simplified(&clean_path(&joined)).to_path_buf()
}

/// Make `path` relative to the current working directory if possible.
pub fn relativize(path: &Path) -> PathBuf {
    let path = clean_path(path);
    match std::env::current_dir() {
        Ok(cwd) => path.strip_prefix(&cwd).map(Path::to_path_buf).unwrap_or(path),
        Err(_) => path,
    }
}

/// Resolve `.` and `..` components lexically.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            component => out.push(component),
        }
    }
    out
}

/// Render a path the way it is recorded in cache files: forward slashes on
/// all platforms so records are portable between hosts.
pub fn record_path(path: &Path) -> String {
    path.to_slash_lossy().into_owned()
}

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|err| IoError::new(err, path))?;
    serde_json::from_str(&contents).map_err(BuildError::from)
}

/// Creates the parent directory of the `file` and all its ancestors if it
/// does not exist.
pub fn create_parent_dir_all(file: &Path) -> Result<(), IoError> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| IoError::new(err, parent))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        assert_eq!(compute_hash(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(compute_hash("import a\n"), compute_hash("import a\n"));
        assert_ne!(compute_hash("import a\n"), compute_hash("import b\n"));
    }

    #[test]
    fn cleans_relative_components() {
        let cleaned = clean_path(Path::new("/a/b/../c/./d"));
        assert_eq!(cleaned, Path::new("/a/c/d"));
    }

    #[test]
    fn record_paths_use_forward_slashes() {
        let recorded = record_path(Path::new("pkg").join("mod.py").as_path());
        assert_eq!(recorded, "pkg/mod.py");
    }
}
